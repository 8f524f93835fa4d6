//! Downloading the flash image over a PMTK session. `PMTK182,7` requests
//! stream the log back in 2 KiB chunks of ASCII hex, which are decoded to
//! binary before storage; the stored image is byte-exact flash content.

use futures::{TryStream, TryStreamExt};
use log::{info, warn};
use std::pin::pin;
use thiserror::Error;

use crate::datalog::{LogImage, LogMode, SIZEOF_CHUNK, SIZEOF_SECTOR, SIZEOF_SEPARATOR};
use crate::models;
use crate::probe::DeviceInfo;
use crate::session::{CHUNK_TIMEOUT, PmtkSession, SessionError};
use crate::transport::Transport;

/// Attempts per chunk before a silent device fails the download.
const CHUNK_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("timed out reading chunk at offset {offset:#x} after {attempts} attempts")]
    TimedOut { offset: usize, attempts: u32 },
    #[error("malformed chunk reply: {reply}")]
    MalformedReply { reply: String },
    #[error("chunk at offset {offset:#x} is not valid hex")]
    BadHexPayload { offset: usize },
}

/// How much flash to pull. STOP mode reads up to the next write position
/// rounded to a whole sector; OVERLAP mode must read the entire flash
/// since the oldest data may sit anywhere.
pub fn bytes_to_read(info: &DeviceInfo) -> usize {
    match info.mode {
        LogMode::Overlap => models::flash_memory_size(&info.model_id),
        LogMode::Stop => {
            let mut sectors = info.next_write_address as usize / SIZEOF_SECTOR;
            if info.next_write_address as usize % SIZEOF_SECTOR != 0 {
                sectors += 1;
            }
            sectors * SIZEOF_SECTOR
        }
    }
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(text.len() / 2);
    for pair in text.as_bytes().chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}

/// Pulls the log region chunk by chunk. The read ends early when a
/// sector-aligned chunk opens with 16 bytes of 0xFF: flash past that
/// point was never written.
pub struct MemoryReader<'s, T> {
    session: &'s mut PmtkSession<T>,
    total: usize,
    offset: usize,
    done: bool,
}

impl<'s, T: Transport> MemoryReader<'s, T> {
    pub fn new(session: &'s mut PmtkSession<T>, info: &DeviceInfo) -> Self {
        let total = bytes_to_read(info);
        MemoryReader {
            session,
            total,
            offset: 0,
            done: false,
        }
    }

    /// Bytes the device is expected to serve.
    pub fn bytes_expected(&self) -> usize {
        self.total
    }

    pub fn as_stream(
        &mut self,
    ) -> impl TryStream<Ok = Vec<u8>, Error = DownloadError, Item = Result<Vec<u8>, DownloadError>> + '_
    {
        futures::stream::try_unfold(self, |reader| async {
            match reader.next_chunk().await? {
                Some(chunk) => Ok(Some((chunk, reader))),
                None => Ok(None),
            }
        })
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadError> {
        if self.done || self.offset >= self.total {
            return Ok(None);
        }
        let offset = self.offset;

        let mut reply = None;
        for attempt in 1..=CHUNK_RETRIES {
            self.session
                .send(&format!("PMTK182,7,{offset:08x},{SIZEOF_CHUNK:08x}"))
                .await?;
            match self.session.recv("PMTK182,8,", CHUNK_TIMEOUT).await? {
                Some(msg) => {
                    reply = Some(msg);
                    break;
                }
                None => warn!("no data reply for chunk at {offset:#x} (attempt {attempt})"),
            }
        }
        let Some(reply) = reply else {
            return Err(DownloadError::TimedOut {
                offset,
                attempts: CHUNK_RETRIES,
            });
        };

        let hex = reply
            .splitn(4, ',')
            .nth(3)
            .ok_or_else(|| DownloadError::MalformedReply {
                reply: reply.clone(),
            })?;
        let chunk = decode_hex(hex).ok_or(DownloadError::BadHexPayload { offset })?;

        // every data reply is trailed by a command ack
        if self
            .session
            .recv("PMTK001,182,7,3", CHUNK_TIMEOUT)
            .await?
            .is_none()
        {
            warn!("missing ack for chunk at {offset:#x}");
        }

        if offset % SIZEOF_SECTOR == 0
            && chunk.len() >= SIZEOF_SEPARATOR
            && chunk[..SIZEOF_SEPARATOR].iter().all(|&b| b == 0xff)
        {
            info!("sector at {offset:#x} is non-written space, ending read");
            self.done = true;
            return Ok(Some(chunk));
        }
        self.offset += SIZEOF_CHUNK;
        Ok(Some(chunk))
    }
}

/// Download the device log into memory. `progress` sees monotonic
/// `(bytes_read, bytes_expected)` pairs.
pub async fn download<T, F>(
    session: &mut PmtkSession<T>,
    info: &DeviceInfo,
    mut progress: F,
) -> Result<LogImage, DownloadError>
where
    T: Transport,
    F: FnMut(usize, usize),
{
    let mut reader = MemoryReader::new(session, info);
    let total = reader.bytes_expected();
    info!("retrieving {total} ({total:#010x}) bytes of log data");

    let mut data = Vec::with_capacity(total);
    {
        let mut chunks = pin!(reader.as_stream());
        while let Some(chunk) = chunks.try_next().await? {
            data.extend_from_slice(&chunk);
            progress(data.len().min(total), total);
        }
    }

    Ok(LogImage {
        data,
        expected_records_total: Some(info.record_count),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet;
    use crate::transport::TransportError;
    use std::collections::VecDeque;

    fn device_info(mode: LogMode, next_write_address: u32) -> DeviceInfo {
        DeviceInfo {
            firmware: "3".to_string(),
            release: "AXN_1.0".to_string(),
            model_id: "001d".to_string(),
            log_format: 0x3f,
            mode,
            next_write_address,
            record_count: 100,
        }
    }

    /// Serves chunk requests straight out of a golden flash image.
    struct FlashPort {
        image: Vec<u8>,
        outgoing: VecDeque<u8>,
    }

    impl FlashPort {
        fn new(image: Vec<u8>) -> Self {
            FlashPort {
                image,
                outgoing: VecDeque::new(),
            }
        }

        fn respond(&mut self, payload: &str) {
            self.outgoing.extend(packet::encode(payload).into_bytes());
        }
    }

    impl Transport for FlashPort {
        async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            let line = std::str::from_utf8(bytes).unwrap();
            let payload = line
                .trim_end()
                .trim_start_matches('$')
                .rsplit_once('*')
                .unwrap()
                .0;
            if let Some(args) = payload.strip_prefix("PMTK182,7,") {
                let (offset, len) = args.split_once(',').unwrap();
                let offset = usize::from_str_radix(offset, 16).unwrap();
                let len = usize::from_str_radix(len, 16).unwrap();
                let end = (offset + len).min(self.image.len());
                let hex: String = self.image[offset..end]
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect();
                self.respond(&format!("PMTK182,8,{offset:08x},{hex}"));
                self.respond("PMTK001,182,7,3");
            }
            Ok(())
        }

        async fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            let n = buf.len().min(self.outgoing.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.outgoing.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    fn golden_image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_bytes_to_read() {
        // STOP mode rounds the next write address up to a whole sector
        let info = device_info(LogMode::Stop, 0x12345);
        assert_eq!(bytes_to_read(&info), 2 * SIZEOF_SECTOR);
        let info = device_info(LogMode::Stop, SIZEOF_SECTOR as u32);
        assert_eq!(bytes_to_read(&info), SIZEOF_SECTOR);
        // OVERLAP mode reads the whole flash
        let info = device_info(LogMode::Overlap, 0x800);
        assert_eq!(bytes_to_read(&info), 2 * 1024 * 1024);
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(decode_hex("00FF10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(decode_hex("0"), None);
        assert_eq!(decode_hex("zz"), None);
    }

    #[tokio::test]
    async fn test_chunked_download_reassembles_image() {
        let image = golden_image(SIZEOF_SECTOR);
        let mut session = PmtkSession::new(FlashPort::new(image.clone()));
        let info = device_info(LogMode::Stop, SIZEOF_SECTOR as u32);

        let mut updates = Vec::new();
        let downloaded = download(&mut session, &info, |read, expected| {
            updates.push((read, expected));
        })
        .await
        .unwrap();

        assert_eq!(downloaded.data, image);
        assert_eq!(downloaded.expected_records_total, Some(100));
        // 0x10000 / 0x800 chunks, monotonic progress
        assert_eq!(updates.len(), 32);
        assert!(updates.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(updates.last(), Some(&(SIZEOF_SECTOR, SIZEOF_SECTOR)));
    }

    #[tokio::test]
    async fn test_download_stops_at_unwritten_sector() {
        let mut image = golden_image(2 * SIZEOF_SECTOR);
        for b in &mut image[SIZEOF_SECTOR..] {
            *b = 0xff;
        }
        let mut session = PmtkSession::new(FlashPort::new(image.clone()));
        let info = device_info(LogMode::Stop, 2 * SIZEOF_SECTOR as u32);

        let downloaded = download(&mut session, &info, |_, _| {}).await.unwrap();

        // the FF chunk that revealed the unwritten sector is kept
        assert_eq!(downloaded.data.len(), SIZEOF_SECTOR + SIZEOF_CHUNK);
        assert_eq!(&downloaded.data[..SIZEOF_SECTOR], &image[..SIZEOF_SECTOR]);
    }

    #[tokio::test]
    async fn test_download_times_out_on_silent_device() {
        struct SilentPort;
        impl Transport for SilentPort {
            async fn write_all(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
                Ok(())
            }
            async fn read_available(&mut self, _buf: &mut [u8]) -> Result<usize, TransportError> {
                Ok(0)
            }
        }

        let mut session = PmtkSession::new(SilentPort);
        let info = device_info(LogMode::Stop, 0x800);
        tokio::time::pause();
        let err = download(&mut session, &info, |_, _| {}).await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::TimedOut {
                offset: 0,
                attempts: 3
            }
        ));
    }
}
