//! PMTK wire framing. Commands and replies travel as ASCII lines of the
//! form `$PAYLOAD*hh\r\n`, where `hh` is the XOR of every payload byte in
//! lowercase hex.

use log::warn;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("packet checksum mismatch (computed {computed:#04x}, received {received:#04x})")]
pub struct ChecksumMismatch {
    pub computed: u8,
    pub received: u8,
}

pub fn xor_checksum(payload: &str) -> u8 {
    payload.bytes().fold(0, |acc, b| acc ^ b)
}

/// Frame a command payload for the wire.
pub fn encode(payload: &str) -> String {
    format!("${payload}*{:02x}\r\n", xor_checksum(payload))
}

/// A deframed reply. A checksum mismatch does not drop the frame: the
/// payload is still handed to the caller, flagged so it can decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: String,
    pub checksum: Result<(), ChecksumMismatch>,
}

impl Frame {
    pub fn checksum_ok(&self) -> bool {
        self.checksum.is_ok()
    }
}

/// Accumulates raw serial bytes and yields complete frames. Partial lines
/// stay buffered until their terminating `\n` arrives.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
}

impl Deframer {
    pub fn new() -> Self {
        Deframer::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` if the buffer holds no full line.
    /// Lines that don't parse as `$…*hh` are dropped with a warning.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let nl = self.buf.iter().position(|&b| b == b'\n')?;
            let line: Vec<u8> = self.buf.drain(..=nl).collect();
            match parse_line(&line) {
                Some(frame) => return Some(frame),
                None => warn!(
                    "discarding malformed line: {:?}",
                    String::from_utf8_lossy(&line)
                ),
            }
        }
    }
}

fn parse_line(line: &[u8]) -> Option<Frame> {
    let text = std::str::from_utf8(line).ok()?;
    let text = text.trim_end_matches(['\r', '\n']);
    let rest = text.strip_prefix('$')?;
    let (payload, checksum) = rest.rsplit_once('*')?;
    if checksum.len() != 2 {
        return None;
    }
    let received = u8::from_str_radix(checksum, 16).ok()?;
    let computed = xor_checksum(payload);
    let checksum = if received == computed {
        Ok(())
    } else {
        Err(ChecksumMismatch { computed, received })
    };
    Some(Frame {
        payload: payload.to_string(),
        checksum,
    })
}
