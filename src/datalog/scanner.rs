//! Walks a flash image sector by sector, classifying in-stream separators
//! and decoding records under the live format bitmask. Emits a lazy,
//! forward-only sequence of tagged points and track-segment breaks.

use log::{debug, info, warn};
use thiserror::Error;

use super::header::{HeaderError, SectorHeader};
use super::record::{self, LogRecord, RecordError};
use super::{
    LogImage, RCR_BUTTON, SIZEOF_SECTOR, SIZEOF_SECTOR_HEADER, SIZEOF_SEPARATOR, SeparatorType,
    VALID_NO_FIX, WRITING_SECTOR_COUNT, describe_log_format,
};
use crate::models::{self, ModelProfile};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("corrupt sector header at offset {offset:#x}: {source}")]
    CorruptSector { offset: usize, source: HeaderError },
    #[error("non-written space at offset {offset:#x} outside the writing sector")]
    PrematureEndOfSector { offset: usize },
    #[error("record at offset {offset:#x} truncated")]
    TruncatedRecord { offset: usize },
    #[error(
        "record checksum mismatch at offset {offset:#x} (computed {computed:#04x}, stored {stored:#04x})"
    )]
    RecordChecksum {
        offset: usize,
        computed: u8,
        stored: u8,
    },
    #[error("bad record checksum separator at offset {offset:#x} (found {found:#04x})")]
    BadChecksumSeparator { offset: usize, found: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    TrackPoint,
    Waypoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRecord {
    pub kind: RecordKind,
    pub record: LogRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanItem {
    Point(TaggedRecord),
    /// Track segment boundary: a control separator, a non-written gap, or
    /// a lost fix.
    SegmentBreak,
}

enum Separator<'w> {
    Control { kind: Option<SeparatorType>, arg: u32 },
    NonWritten,
    Holux { model_label: &'w [u8], waypoint: bool },
    None,
}

fn classify_separator(window: &[u8]) -> Separator<'_> {
    debug_assert_eq!(window.len(), SIZEOF_SEPARATOR);
    if window.iter().all(|&b| b == 0xff) {
        return Separator::NonWritten;
    }
    if window[..7].iter().all(|&b| b == 0xaa) && window[12..].iter().all(|&b| b == 0xbb) {
        let kind = SeparatorType::try_from(window[7]).ok();
        let arg = u32::from_le_bytes(window[8..12].try_into().expect("window is 16 bytes"));
        return Separator::Control { kind, arg };
    }
    if window.starts_with(b"HOLUX") {
        return Separator::Holux {
            model_label: &window[5..10],
            waypoint: &window[10..16] == b"WAYPNT",
        };
    }
    Separator::None
}

enum Tagged {
    Point(TaggedRecord),
    NoFix,
    Dropped,
}

fn tag_record(record: LogRecord, force_waypoint: bool) -> Tagged {
    let no_fix = record.valid == Some(VALID_NO_FIX);
    let button = record.rcr.is_some_and(|rcr| rcr & RCR_BUTTON != 0);
    let has_position = record.latitude.is_some() && record.longitude.is_some();
    if no_fix && !force_waypoint {
        return Tagged::NoFix;
    }
    if !has_position {
        return Tagged::Dropped;
    }
    let kind = if force_waypoint || button {
        RecordKind::Waypoint
    } else {
        RecordKind::TrackPoint
    };
    Tagged::Point(TaggedRecord { kind, record })
}

/// Iterator over one flash image. Decoding never mutates the image;
/// per-sector state is re-latched at every 64 KiB boundary.
pub struct LogScanner<'a> {
    data: &'a [u8],
    pos: usize,
    profile: ModelProfile,
    lenient: bool,
    expected_total: Option<u32>,
    log_format: u32,
    sector_expected: u16,
    records_in_sector: u32,
    total_records: u32,
    checksum_failures: u32,
    force_waypoint: bool,
    done: bool,
}

impl<'a> LogScanner<'a> {
    pub fn new(image: &'a LogImage, profile: ModelProfile, lenient: bool) -> Self {
        LogScanner {
            data: &image.data,
            pos: 0,
            profile,
            lenient,
            expected_total: image.expected_records_total,
            log_format: 0,
            sector_expected: 0,
            records_in_sector: 0,
            total_records: 0,
            checksum_failures: 0,
            force_waypoint: false,
            done: false,
        }
    }

    /// Records decoded so far, including dropped and skipped ones.
    pub fn total_records(&self) -> u32 {
        self.total_records
    }

    /// Records dropped for a bad XOR in lenient mode.
    pub fn checksum_failures(&self) -> u32 {
        self.checksum_failures
    }

    fn advance_to_next_sector(&mut self) {
        self.pos = (self.pos / SIZEOF_SECTOR + 1) * SIZEOF_SECTOR;
    }

    fn enter_sector(&mut self) -> Result<(), ScanError> {
        let header = SectorHeader::parse(&self.data[self.pos..]).map_err(|source| {
            ScanError::CorruptSector {
                offset: self.pos,
                source,
            }
        })?;
        debug!(
            "sector at {:#x}: {} records, format {:#010x} ({})",
            self.pos,
            header.record_count,
            header.log_format,
            describe_log_format(header.log_format)
        );
        self.sector_expected = header.record_count;
        self.log_format = header.log_format;
        self.records_in_sector = 0;
        self.pos += SIZEOF_SECTOR_HEADER;
        Ok(())
    }

    fn apply_control(&mut self, kind: Option<SeparatorType>, arg: u32) {
        match kind {
            Some(SeparatorType::ChangeLogBitmask) => {
                info!(
                    "log format changed to {:#010x} ({})",
                    arg,
                    describe_log_format(arg)
                );
                self.log_format = arg;
            }
            Some(SeparatorType::ChangeLogPeriod) => {
                info!("log period changed to {:.1} s", f64::from(arg) / 10.0)
            }
            Some(SeparatorType::ChangeLogDistance) => {
                info!("log distance changed to {:.1} m", f64::from(arg) / 10.0)
            }
            Some(SeparatorType::ChangeLogSpeed) => {
                info!("log speed changed to {:.1} km/h", f64::from(arg) / 10.0)
            }
            Some(SeparatorType::ChangeOverlapStop) => info!("overlap/stop mode changed ({arg})"),
            Some(SeparatorType::ChangeStartStop) => info!("logging started/stopped ({arg})"),
            None => warn!("separator with unknown type byte, ignoring"),
        }
    }

    fn next_item(&mut self) -> Option<Result<ScanItem, ScanError>> {
        let data = self.data;
        loop {
            if self.done {
                return None;
            }
            if let Some(total) = self.expected_total
                && self.total_records >= total
            {
                debug!("reached device-reported record total {total}");
                self.done = true;
                return None;
            }
            if self.pos >= data.len() {
                self.done = true;
                return None;
            }
            if self.pos % SIZEOF_SECTOR == 0
                && let Err(e) = self.enter_sector()
            {
                self.done = true;
                return Some(Err(e));
            }
            if self.sector_expected != WRITING_SECTOR_COUNT
                && self.records_in_sector >= u32::from(self.sector_expected)
            {
                self.advance_to_next_sector();
                continue;
            }

            let sector_end = ((self.pos / SIZEOF_SECTOR + 1) * SIZEOF_SECTOR).min(data.len());
            if sector_end - self.pos >= SIZEOF_SEPARATOR {
                let window = &data[self.pos..self.pos + SIZEOF_SEPARATOR];
                match classify_separator(window) {
                    Separator::Control { kind, arg } => {
                        self.pos += SIZEOF_SEPARATOR;
                        self.apply_control(kind, arg);
                        return Some(Ok(ScanItem::SegmentBreak));
                    }
                    Separator::NonWritten => {
                        if self.sector_expected == WRITING_SECTOR_COUNT {
                            debug!("end of writing sector at {:#x}", self.pos);
                            self.advance_to_next_sector();
                            return Some(Ok(ScanItem::SegmentBreak));
                        }
                        self.done = true;
                        return Some(Err(ScanError::PrematureEndOfSector { offset: self.pos }));
                    }
                    Separator::Holux {
                        model_label,
                        waypoint,
                    } => {
                        self.pos += SIZEOF_SEPARATOR;
                        // fw 1.13 devices pad the separator with four
                        // spaces outside the 16-byte window
                        let trailing = data.len() - self.pos >= 4
                            && &data[self.pos..self.pos + 4] == b"    ";
                        if trailing {
                            self.pos += 4;
                        }
                        let model = models::holux_model(model_label, trailing);
                        self.profile = ModelProfile::for_model(model);
                        if waypoint {
                            self.force_waypoint = true;
                        }
                        info!("Holux separator, switching to model {model}");
                        continue;
                    }
                    Separator::None => {}
                }
            }

            let offset = self.pos;
            match record::decode(&data[offset..sector_end], self.log_format, &self.profile) {
                Ok((rec, used)) => {
                    self.pos += used;
                    self.records_in_sector += 1;
                    self.total_records += 1;
                    let force = std::mem::take(&mut self.force_waypoint);
                    match tag_record(rec, force) {
                        Tagged::Point(point) => return Some(Ok(ScanItem::Point(point))),
                        Tagged::NoFix => return Some(Ok(ScanItem::SegmentBreak)),
                        Tagged::Dropped => continue,
                    }
                }
                Err(RecordError::ChecksumMismatch {
                    computed,
                    stored,
                    consumed,
                }) => {
                    if self.lenient {
                        warn!(
                            "dropping record at {offset:#x} (checksum {computed:#04x} != {stored:#04x})"
                        );
                        self.checksum_failures += 1;
                        self.pos += consumed;
                        self.records_in_sector += 1;
                        self.total_records += 1;
                        self.force_waypoint = false;
                        continue;
                    }
                    self.done = true;
                    return Some(Err(ScanError::RecordChecksum {
                        offset,
                        computed,
                        stored,
                    }));
                }
                Err(RecordError::BadChecksumSeparator { found }) => {
                    self.done = true;
                    return Some(Err(ScanError::BadChecksumSeparator { offset, found }));
                }
                Err(RecordError::Truncated { offset: rel }) => {
                    self.done = true;
                    return Some(Err(ScanError::TruncatedRecord {
                        offset: offset + rel,
                    }));
                }
            }
        }
    }
}

impl<'a> Iterator for LogScanner<'a> {
    type Item = Result<ScanItem, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item()
    }
}
