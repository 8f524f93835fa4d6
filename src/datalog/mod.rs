//! The on-flash log format: 64 KiB sectors, each opening with a 512-byte
//! header, followed by records whose layout is driven by a 20-bit field
//! bitmask. Control separators interspersed with the records signal
//! logging-parameter changes, unwritten space, and Holux vendor breaks.

pub mod header;
pub mod record;
pub mod scanner;

use num_enum::TryFromPrimitive;

pub const SIZEOF_SECTOR: usize = 0x10000;
pub const SIZEOF_SECTOR_HEADER: usize = 0x200;
pub const SIZEOF_SEPARATOR: usize = 0x10;
pub const SIZEOF_CHUNK: usize = 0x800;

/// Sector record count marking the sector currently being appended to.
pub const WRITING_SECTOR_COUNT: u16 = 0xffff;

// Field bits of the log format bitmask, in on-flash order.
pub const FMT_UTC: u32 = 0x00001;
pub const FMT_VALID: u32 = 0x00002;
pub const FMT_LATITUDE: u32 = 0x00004;
pub const FMT_LONGITUDE: u32 = 0x00008;
pub const FMT_HEIGHT: u32 = 0x00010;
pub const FMT_SPEED: u32 = 0x00020;
pub const FMT_HEADING: u32 = 0x00040;
pub const FMT_DSTA: u32 = 0x00080;
pub const FMT_DAGE: u32 = 0x00100;
pub const FMT_PDOP: u32 = 0x00200;
pub const FMT_HDOP: u32 = 0x00400;
pub const FMT_VDOP: u32 = 0x00800;
pub const FMT_NSAT: u32 = 0x01000;
pub const FMT_SID: u32 = 0x02000;
pub const FMT_ELEVATION: u32 = 0x04000;
pub const FMT_AZIMUTH: u32 = 0x08000;
pub const FMT_SNR: u32 = 0x10000;
pub const FMT_RCR: u32 = 0x20000;
pub const FMT_MILLISECOND: u32 = 0x40000;
pub const FMT_DISTANCE: u32 = 0x80000;

/// VALID fix-quality values.
pub const VALID_NO_FIX: u16 = 0x0001;
pub const VALID_SPS: u16 = 0x0002;
pub const VALID_DGPS: u16 = 0x0004;
pub const VALID_PPS: u16 = 0x0008;
pub const VALID_RTK: u16 = 0x0010;
pub const VALID_FRTK: u16 = 0x0020;
pub const VALID_ESTIMATED: u16 = 0x0040;
pub const VALID_MANUAL: u16 = 0x0080;
pub const VALID_SIMULATOR: u16 = 0x0100;

// RCR record-cause bits.
pub const RCR_TIME: u16 = 0x01;
pub const RCR_SPEED: u16 = 0x02;
pub const RCR_DISTANCE: u16 = 0x04;
pub const RCR_BUTTON: u16 = 0x08;

/// Behaviour when the flash fills up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum LogMode {
    Overlap = 1,
    Stop = 2,
}

/// Type byte of an in-stream control separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SeparatorType {
    ChangeLogBitmask = 0x02,
    ChangeLogPeriod = 0x03,
    ChangeLogDistance = 0x04,
    ChangeLogSpeed = 0x05,
    ChangeOverlapStop = 0x06,
    ChangeStartStop = 0x07,
}

/// The downloaded flash image. Produced once by the memory reader (or
/// loaded back from a dump file) and immutable thereafter.
#[derive(Debug, Clone)]
pub struct LogImage {
    pub data: Vec<u8>,
    /// Device-reported total record count, when known.
    pub expected_records_total: Option<u32>,
}

impl LogImage {
    /// Wrap a dump file read back from disk; the record total is unknown.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        LogImage {
            data,
            expected_records_total: None,
        }
    }
}

const FIELD_NAMES: [(u32, &str); 20] = [
    (FMT_UTC, "UTC"),
    (FMT_VALID, "VALID"),
    (FMT_LATITUDE, "LATITUDE"),
    (FMT_LONGITUDE, "LONGITUDE"),
    (FMT_HEIGHT, "HEIGHT"),
    (FMT_SPEED, "SPEED"),
    (FMT_HEADING, "HEADING"),
    (FMT_DSTA, "DSTA"),
    (FMT_DAGE, "DAGE"),
    (FMT_PDOP, "PDOP"),
    (FMT_HDOP, "HDOP"),
    (FMT_VDOP, "VDOP"),
    (FMT_NSAT, "NSAT"),
    (FMT_SID, "SID"),
    (FMT_ELEVATION, "ELEVATION"),
    (FMT_AZIMUTH, "AZIMUTH"),
    (FMT_SNR, "SNR"),
    (FMT_RCR, "RCR"),
    (FMT_MILLISECOND, "MILLISECOND"),
    (FMT_DISTANCE, "DISTANCE"),
];

/// Comma-joined names of the fields enabled in `format`.
pub fn describe_log_format(format: u32) -> String {
    FIELD_NAMES
        .iter()
        .filter(|(bit, _)| format & bit != 0)
        .map(|&(_, name)| name)
        .collect::<Vec<_>>()
        .join(",")
}
