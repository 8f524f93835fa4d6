//! Finding and identifying MTK loggers: handshake a candidate port, sweep
//! the speed table for the fastest rate the device answers at, then pull
//! its identity and logging parameters.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::datalog::{LogMode, describe_log_format};
use crate::session::{PmtkSession, REPLY_TIMEOUT, SessionError};
use crate::transport::{PORT_SPEEDS, SerialPort, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no reply to {query}")]
    NoReply { query: String },
    #[error("malformed reply to {query}: {reply}")]
    MalformedReply { query: String, reply: String },
    #[error("no MTK logger found")]
    NoDeviceFound,
}

/// Identity and logging parameters reported by the device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub firmware: String,
    pub release: String,
    pub model_id: String,
    pub log_format: u32,
    pub mode: LogMode,
    pub next_write_address: u32,
    pub record_count: u32,
}

/// Send the PMTK test command and wait for its ack. A true result means
/// an MTK logger is listening at this speed.
pub async fn handshake<T: Transport>(session: &mut PmtkSession<T>) -> Result<bool, SessionError> {
    session.send("PMTK000").await?;
    Ok(session.recv("PMTK001,0,", REPLY_TIMEOUT).await?.is_some())
}

/// Open `path` at `speed` and handshake once.
pub async fn check_port(path: &Path, speed: u32) -> Result<bool, TransportError> {
    let port = SerialPort::open(path, speed)?;
    let mut session = PmtkSession::new(port);
    match handshake(&mut session).await {
        Ok(answered) => Ok(answered),
        Err(SessionError::Transport(e)) => Err(e),
    }
}

/// Sweep the known speed list and return the highest speed the device
/// answers at. Speeds the host cannot set are skipped.
pub async fn detect_max_speed(path: &Path) -> Result<u32, ProbeError> {
    let mut best = None;
    for &speed in PORT_SPEEDS.iter() {
        match check_port(path, speed).await {
            Ok(true) => {
                debug!("{} answers at {speed} baud", path.display());
                best = Some(speed);
            }
            Ok(false) => debug!("{} silent at {speed} baud", path.display()),
            Err(TransportError::UnsupportedBaudRate(s)) => {
                warn!("skipping unsupported baud rate {s}");
            }
            Err(e) => return Err(SessionError::Transport(e).into()),
        }
    }
    best.ok_or(ProbeError::NoDeviceFound)
}

/// Candidate serial devices under /dev, sorted.
pub fn discover_ports() -> Vec<PathBuf> {
    const PREFIXES: [&str; 4] = ["ttyUSB", "ttyACM", "cu.usbmodem", "cu.usbserial"];
    let mut ports = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if PREFIXES.iter().any(|p| name.starts_with(p)) {
                ports.push(entry.path());
            }
        }
    }
    ports.sort();
    ports
}

/// Probe every candidate port and return the first logger found with its
/// best speed.
pub async fn find_device() -> Result<(PathBuf, u32), ProbeError> {
    for path in discover_ports() {
        if let Ok(speed) = detect_max_speed(&path).await {
            info!("found logger on {} at {speed} baud", path.display());
            return Ok((path, speed));
        }
    }
    Err(ProbeError::NoDeviceFound)
}

fn field<'r>(reply: &'r str, index: usize, query: &str) -> Result<&'r str, ProbeError> {
    reply
        .split(',')
        .nth(index)
        .ok_or_else(|| ProbeError::MalformedReply {
            query: query.to_string(),
            reply: reply.to_string(),
        })
}

fn hex_field(reply: &str, index: usize, query: &str) -> Result<u32, ProbeError> {
    let text = field(reply, index, query)?;
    u32::from_str_radix(text, 16).map_err(|_| ProbeError::MalformedReply {
        query: query.to_string(),
        reply: reply.to_string(),
    })
}

async fn query<T: Transport>(
    session: &mut PmtkSession<T>,
    command: &str,
    prefix: &str,
) -> Result<String, ProbeError> {
    session
        .query(command, prefix)
        .await?
        .ok_or_else(|| ProbeError::NoReply {
            query: command.to_string(),
        })
}

/// Query log parameter `n`. The device acks each parameter query after
/// the data reply; consuming the ack keeps it from polluting later
/// exchanges.
async fn query_param<T: Transport>(
    session: &mut PmtkSession<T>,
    n: u32,
) -> Result<String, ProbeError> {
    let command = format!("PMTK182,2,{n}");
    let prefix = format!("PMTK182,3,{n},");
    let reply = query(session, &command, &prefix).await?;
    session.recv("PMTK001,182,2,3", REPLY_TIMEOUT).await?;
    Ok(reply)
}

/// Run the identity and parameter query sequence on a device that has
/// already answered the handshake.
pub async fn identify<T: Transport>(
    session: &mut PmtkSession<T>,
) -> Result<DeviceInfo, ProbeError> {
    let reply = query(session, "PMTK604", "PMTK001,604,").await?;
    let firmware = field(&reply, 2, "PMTK604")?.to_string();

    let reply = query(session, "PMTK605", "PMTK705,").await?;
    let release = field(&reply, 1, "PMTK605")?.to_string();
    let model_id = field(&reply, 2, "PMTK605")?.to_string();
    info!("MTK firmware {firmware}, release {release}, model {model_id}");

    let reply = query_param(session, 2).await?;
    let log_format = hex_field(&reply, 3, "PMTK182,2,2")?;
    info!("log format: {}", describe_log_format(log_format));

    let reply = query_param(session, 6).await?;
    let mode_raw: u16 = field(&reply, 3, "PMTK182,2,6")?
        .parse()
        .map_err(|_| ProbeError::MalformedReply {
            query: "PMTK182,2,6".to_string(),
            reply: reply.clone(),
        })?;
    let mode = LogMode::try_from(mode_raw).map_err(|_| ProbeError::MalformedReply {
        query: "PMTK182,2,6".to_string(),
        reply: reply.clone(),
    })?;
    info!("recording method on memory full: {mode:?}");

    let reply = query_param(session, 8).await?;
    let next_write_address = hex_field(&reply, 3, "PMTK182,2,8")?;
    info!("next write address: {next_write_address:#x} ({next_write_address})");

    let reply = query_param(session, 10).await?;
    let record_count = hex_field(&reply, 3, "PMTK182,2,10")?;
    info!("number of records: {record_count}");

    Ok(DeviceInfo {
        firmware,
        release,
        model_id,
        log_format,
        mode,
        next_write_address,
        record_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::encode;
    use crate::transport::TransportError;
    use std::collections::VecDeque;

    struct ReplayPort {
        incoming: VecDeque<Vec<u8>>,
    }

    impl ReplayPort {
        fn new(replies: &[&str]) -> Self {
            ReplayPort {
                incoming: replies.iter().map(|r| encode(r).into_bytes()).collect(),
            }
        }
    }

    impl Transport for ReplayPort {
        async fn write_all(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
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
    async fn test_identify_sequence() {
        let port = ReplayPort::new(&[
            "PMTK001,604,3",
            "PMTK705,AXN_1.0-B_1.3_C01,001d,QST1300",
            "PMTK182,3,2,0002003F",
            "PMTK001,182,2,3",
            "PMTK182,3,6,2",
            "PMTK001,182,2,3",
            "PMTK182,3,8,00012345",
            "PMTK001,182,2,3",
            "PMTK182,3,10,00000A21",
            "PMTK001,182,2,3",
        ]);
        let mut session = PmtkSession::new(port);
        let info = identify(&mut session).await.unwrap();
        assert_eq!(info.firmware, "3");
        assert_eq!(info.release, "AXN_1.0-B_1.3_C01");
        assert_eq!(info.model_id, "001d");
        assert_eq!(info.log_format, 0x0002_003f);
        assert_eq!(info.mode, LogMode::Stop);
        assert_eq!(info.next_write_address, 0x12345);
        assert_eq!(info.record_count, 0xa21);
    }

    #[tokio::test]
    async fn test_handshake_silence() {
        let port = ReplayPort::new(&[]);
        let mut session = PmtkSession::new(port);
        // burn only a short deadline in tests: recv() would wait 500 ms,
        // so call the underlying primitive directly
        session.send("PMTK000").await.unwrap();
        let reply = session
            .recv("PMTK001,0,", std::time::Duration::from_millis(30))
            .await
            .unwrap();
        assert!(reply.is_none());
    }
}
