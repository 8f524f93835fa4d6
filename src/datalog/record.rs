//! Decoding a single log record. The layout is not fixed: the live format
//! bitmask selects which fields are present, the model profile sets the
//! width of a handful of them, and the satellite block repeats. Every data
//! byte is folded into an XOR accumulator that must match the trailing
//! checksum byte.

use bytes::Buf;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::{
    FMT_AZIMUTH, FMT_DAGE, FMT_DISTANCE, FMT_DSTA, FMT_ELEVATION, FMT_HDOP, FMT_HEADING,
    FMT_HEIGHT, FMT_LATITUDE, FMT_LONGITUDE, FMT_MILLISECOND, FMT_NSAT, FMT_PDOP, FMT_RCR,
    FMT_SID, FMT_SNR, FMT_SPEED, FMT_UTC, FMT_VALID, FMT_VDOP,
};
use crate::models::ModelProfile;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record truncated at byte {offset}")]
    Truncated { offset: usize },
    #[error("record checksum mismatch (computed {computed:#04x}, stored {stored:#04x})")]
    ChecksumMismatch {
        computed: u8,
        stored: u8,
        /// Bytes the record occupied, so a lenient caller can skip it.
        consumed: usize,
    },
    #[error("bad checksum separator (expected '*', found {found:#04x})")]
    BadChecksumSeparator { found: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Satellite {
    pub sid: u8,
    pub in_use: bool,
    pub elevation: Option<i16>,
    pub azimuth: Option<u16>,
    pub snr: Option<u16>,
}

/// One decoded record. Fields absent from the format bitmask are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogRecord {
    pub utc: Option<DateTime<Utc>>,
    pub valid: Option<u16>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub height: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub dsta: Option<u16>,
    pub dage: Option<u32>,
    pub pdop: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub nsat_in_view: Option<u8>,
    pub nsat_in_use: Option<u8>,
    pub satellites: Vec<Satellite>,
    pub rcr: Option<u16>,
    pub millisecond: Option<u16>,
    pub distance: Option<f64>,
}

/// Cursor over record bytes that folds everything it reads into the XOR
/// accumulator, except the raw takes used for the separator and checksum.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    checksum: u8,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        FieldReader {
            data,
            pos: 0,
            checksum: 0,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], RecordError> {
        if self.pos + n > self.data.len() {
            return Err(RecordError::Truncated { offset: self.pos });
        }
        let slice = &self.data[self.pos..self.pos + n];
        for &b in slice {
            self.checksum ^= b;
        }
        self.pos += n;
        Ok(slice)
    }

    fn take_raw(&mut self) -> Result<u8, RecordError> {
        if self.pos >= self.data.len() {
            return Err(RecordError::Truncated { offset: self.pos });
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn take_u8(&mut self) -> Result<u8, RecordError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, RecordError> {
        Ok(self.take(2)?.get_u16_le())
    }

    fn take_u32(&mut self) -> Result<u32, RecordError> {
        Ok(self.take(4)?.get_u32_le())
    }

    /// A little-endian float of model-dependent width. Three-byte values
    /// are the high three bytes of an IEEE-754 single.
    fn take_number(&mut self, width: usize) -> Result<f64, RecordError> {
        let bytes = self.take(width)?;
        Ok(match width {
            3 => f64::from(f32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]])),
            4 => f64::from(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            8 => f64::from_le_bytes(bytes.try_into().expect("width checked by take")),
            _ => unreachable!("field widths come from the model tables"),
        })
    }
}

/// Decode one record at the start of `data` under `format` and `profile`.
/// Returns the record and the number of bytes it occupied.
pub fn decode(
    data: &[u8],
    format: u32,
    profile: &ModelProfile,
) -> Result<(LogRecord, usize), RecordError> {
    let mut r = FieldReader::new(data);
    let mut rec = LogRecord::default();

    if format & FMT_UTC != 0 {
        rec.utc = DateTime::from_timestamp(i64::from(r.take_u32()?), 0);
    }
    if format & FMT_VALID != 0 {
        rec.valid = Some(r.take_u16()?);
    }
    if format & FMT_LATITUDE != 0 {
        rec.latitude = Some(r.take_number(profile.widths.latitude)?);
    }
    if format & FMT_LONGITUDE != 0 {
        rec.longitude = Some(r.take_number(profile.widths.longitude)?);
    }
    if format & FMT_HEIGHT != 0 {
        rec.height = Some(r.take_number(profile.widths.height)?);
    }
    if format & FMT_SPEED != 0 {
        rec.speed = Some(r.take_number(profile.widths.speed)?);
    }
    if format & FMT_HEADING != 0 {
        rec.heading = Some(r.take_number(profile.widths.heading)?);
    }
    if format & FMT_DSTA != 0 {
        rec.dsta = Some(r.take_u16()?);
    }
    if format & FMT_DAGE != 0 {
        rec.dage = Some(r.take_u32()?);
    }
    if format & FMT_PDOP != 0 {
        rec.pdop = Some(f64::from(r.take_u16()?) / 100.0);
    }
    if format & FMT_HDOP != 0 {
        rec.hdop = Some(f64::from(r.take_u16()?) / 100.0);
    }
    if format & FMT_VDOP != 0 {
        rec.vdop = Some(f64::from(r.take_u16()?) / 100.0);
    }
    if format & FMT_NSAT != 0 {
        rec.nsat_in_view = Some(r.take_u8()?);
        rec.nsat_in_use = Some(r.take_u8()?);
    }
    if format & FMT_SID != 0 {
        // Even with zero satellites in view there is one empty block.
        loop {
            let sid = r.take_u8()?;
            let in_use = r.take_u8()?;
            let in_view = r.take_u16()?;
            if in_view == 0 {
                break;
            }
            let mut sat = Satellite {
                sid,
                in_use: in_use != 0,
                elevation: None,
                azimuth: None,
                snr: None,
            };
            if format & FMT_ELEVATION != 0 {
                sat.elevation = Some(r.take_u16()? as i16);
            }
            if format & FMT_AZIMUTH != 0 {
                sat.azimuth = Some(r.take_u16()?);
            }
            if format & FMT_SNR != 0 {
                sat.snr = Some(r.take_u16()?);
            }
            rec.satellites.push(sat);
            if rec.satellites.len() >= usize::from(in_view) {
                break;
            }
        }
    }
    if format & FMT_RCR != 0 {
        rec.rcr = Some(r.take_u16()?);
    }
    if format & FMT_MILLISECOND != 0 {
        rec.millisecond = Some(r.take_u16()?);
    }
    if format & FMT_DISTANCE != 0 {
        rec.distance = Some(r.take_number(profile.widths.distance)?);
    }

    let computed = r.checksum;
    if profile.checksum_separator {
        let sep = r.take_raw()?;
        if sep != b'*' {
            return Err(RecordError::BadChecksumSeparator { found: sep });
        }
    }
    let stored = r.take_raw()?;
    if stored != computed {
        return Err(RecordError::ChecksumMismatch {
            computed,
            stored,
            consumed: r.pos,
        });
    }
    Ok((rec, r.pos))
}
