//! One PMTK exchange at a time: frame a command out, then poll for the
//! reply whose payload starts with the expected prefix. Frames that don't
//! match are stale replies or unsolicited chatter and are dropped.

use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;
use tokio::time::{Instant, sleep};

use crate::datalog::LogMode;
use crate::packet::{self, Deframer, Frame};
use crate::transport::{Transport, TransportError};

/// Per-packet reply deadline.
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
/// Deadline for bulk log-read chunks, which the device can be slow to serve.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle delay between polls of an empty port.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A command/response session over one serial port. The transport and its
/// read buffer are owned here exclusively; callers serialise commands.
pub struct PmtkSession<T> {
    port: T,
    deframer: Deframer,
    read_buf: Vec<u8>,
}

impl<T: Transport> PmtkSession<T> {
    pub fn new(port: T) -> Self {
        PmtkSession {
            port,
            deframer: Deframer::new(),
            read_buf: vec![0; 4096],
        }
    }

    /// Frame and write one command payload (without `$`/checksum).
    pub async fn send(&mut self, command: &str) -> Result<(), SessionError> {
        let framed = packet::encode(command);
        debug!("send: {}", framed.trim_end());
        self.port.write_all(framed.as_bytes()).await?;
        Ok(())
    }

    /// Wait for a reply whose payload starts with `prefix`, discarding
    /// everything else. Returns `Ok(None)` when the deadline elapses. A
    /// bad frame checksum is logged but the frame is still considered.
    pub async fn recv(
        &mut self,
        prefix: &str,
        timeout: Duration,
    ) -> Result<Option<String>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(frame) = self.next_frame().await? {
                if let Err(e) = &frame.checksum {
                    warn!("{e} on '{}', delivering anyway", frame.payload);
                }
                if frame.payload.starts_with(prefix) {
                    debug!("recv: {}", frame.payload);
                    return Ok(Some(frame.payload));
                }
                debug!("recv: discarding '{}' while waiting for {prefix}", frame.payload);
            }
            if Instant::now() >= deadline {
                debug!("recv: timed out waiting for {prefix}");
                return Ok(None);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Send `command` and wait for `prefix` with the default deadline.
    pub async fn query(
        &mut self,
        command: &str,
        prefix: &str,
    ) -> Result<Option<String>, SessionError> {
        self.send(command).await?;
        self.recv(prefix, REPLY_TIMEOUT).await
    }

    async fn next_frame(&mut self) -> Result<Option<Frame>, SessionError> {
        if let Some(frame) = self.deframer.next_frame() {
            return Ok(Some(frame));
        }
        let n = self.port.read_available(&mut self.read_buf).await?;
        if n > 0 {
            self.deframer.extend(&self.read_buf[..n]);
        }
        Ok(self.deframer.next_frame())
    }

    /// Erase the on-device log. Takes several seconds on a full flash.
    pub async fn erase_log(&mut self) -> Result<bool, SessionError> {
        self.send("PMTK182,6,1").await?;
        Ok(self.recv("PMTK001,182,6,3", CHUNK_TIMEOUT).await?.is_some())
    }

    /// Set the memory-full behaviour (overwrite oldest vs. halt).
    pub async fn set_log_mode(&mut self, mode: LogMode) -> Result<bool, SessionError> {
        self.send(&format!("PMTK182,1,6,{}", mode as u16)).await?;
        Ok(self.recv("PMTK001,182,1,3", REPLY_TIMEOUT).await?.is_some())
    }

    /// Set the logging criteria. Zero disables a criterion. The device
    /// takes each value in tenths (seconds, metres, km/h).
    pub async fn set_log_criteria(
        &mut self,
        period_s: f64,
        distance_m: f64,
        speed_kmh: f64,
    ) -> Result<bool, SessionError> {
        let mut ok = true;
        for (opcode, value) in [(3, period_s), (4, distance_m), (5, speed_kmh)] {
            let tenths = (value * 10.0).round() as u64;
            self.send(&format!("PMTK182,1,{opcode},{tenths}")).await?;
            ok &= self.recv("PMTK001,182,1,3", REPLY_TIMEOUT).await?.is_some();
        }
        Ok(ok)
    }

    pub fn into_inner(self) -> T {
        self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Canned transport: reads pop pre-scripted chunks, writes are kept
    /// for inspection.
    pub(crate) struct ReplayPort {
        pub incoming: VecDeque<Vec<u8>>,
        pub written: Vec<u8>,
    }

    impl ReplayPort {
        pub fn new(replies: &[&str]) -> Self {
            ReplayPort {
                incoming: replies.iter().map(|r| r.as_bytes().to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl Transport for ReplayPort {
        async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.written.extend_from_slice(bytes);
            Ok(())
        }

        async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            match self.incoming.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let port = ReplayPort::new(&["$PMTK001,0,3*30\r\n"]);
        let mut session = PmtkSession::new(port);
        session.send("PMTK000").await.unwrap();
        let reply = session.recv("PMTK001,0,", REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.as_deref(), Some("PMTK001,0,3"));
        assert_eq!(session.into_inner().written, b"$PMTK000*32\r\n");
    }

    #[tokio::test]
    async fn test_corrupt_checksum_still_delivered() {
        let port = ReplayPort::new(&["$PMTK001,0,3*31\r\n"]);
        let mut session = PmtkSession::new(port);
        session.send("PMTK000").await.unwrap();
        let reply = session.recv("PMTK001,0,", REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.as_deref(), Some("PMTK001,0,3"));
    }

    #[tokio::test]
    async fn test_unmatched_frames_discarded() {
        let port = ReplayPort::new(&[
            "$GPGGA,123519,4807.038,N*27\r\n",
            "$PMTK001,604,3*32\r\n",
            "$PMTK001,0,3*30\r\n",
        ]);
        let mut session = PmtkSession::new(port);
        let reply = session.recv("PMTK001,0,", REPLY_TIMEOUT).await.unwrap();
        assert_eq!(reply.as_deref(), Some("PMTK001,0,3"));
    }

    #[tokio::test]
    async fn test_timeout_returns_none() {
        let port = ReplayPort::new(&[]);
        let mut session = PmtkSession::new(port);
        let reply = session
            .recv("PMTK001,0,", Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(reply, None);
    }
}
