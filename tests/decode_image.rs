//! End-to-end decode of a synthetic two-sector flash image into GPX.

use chrono::DateTime;
use mtklog::datalog::scanner::{LogScanner, RecordKind, ScanItem};
use mtklog::datalog::{
    FMT_HEIGHT, FMT_LATITUDE, FMT_LONGITUDE, FMT_RCR, FMT_UTC, FMT_VALID, LogImage, RCR_BUTTON,
    RCR_TIME, SIZEOF_SECTOR,
};
use mtklog::gpx::{GpxOptions, write_gpx};
use mtklog::models::ModelProfile;

const FORMAT: u32 = FMT_UTC | FMT_VALID | FMT_LATITUDE | FMT_LONGITUDE | FMT_HEIGHT | FMT_RCR;
const VALID_SPS: u16 = 0x0002;

fn header_bytes(record_count: u16, log_format: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 0x200];
    buf[0..2].copy_from_slice(&record_count.to_le_bytes());
    buf[2..6].copy_from_slice(&log_format.to_le_bytes());
    buf[6..8].copy_from_slice(&2u16.to_le_bytes());
    buf[506] = b'*';
    buf[508..512].copy_from_slice(&[0xbb; 4]);
    buf
}

fn push_record(buf: &mut Vec<u8>, secs: u32, lat: f64, lon: f64, height: f32, rcr: u16) {
    let mut checksum = 0u8;
    let mut field = |buf: &mut Vec<u8>, bytes: &[u8]| {
        buf.extend_from_slice(bytes);
        for &b in bytes {
            checksum ^= b;
        }
    };
    field(buf, &secs.to_le_bytes());
    field(buf, &VALID_SPS.to_le_bytes());
    field(buf, &lat.to_le_bytes());
    field(buf, &lon.to_le_bytes());
    field(buf, &height.to_le_bytes());
    field(buf, &rcr.to_le_bytes());
    buf.push(b'*');
    buf.push(checksum);
}

fn build_image() -> LogImage {
    // first sector: finished, three records, one of them a button press
    let mut data = header_bytes(3, FORMAT);
    push_record(&mut data, 1_600_000_000, 48.10, 11.50, 520.0, RCR_TIME);
    push_record(&mut data, 1_600_000_010, 48.11, 11.51, 521.0, RCR_TIME);
    push_record(&mut data, 1_600_000_020, 48.12, 11.52, 522.0, RCR_BUTTON);
    data.resize(SIZEOF_SECTOR, 0);

    // second sector: currently writing, one record then unwritten space
    data.extend_from_slice(&header_bytes(0xffff, FORMAT));
    push_record(&mut data, 1_600_000_030, 48.13, 11.53, 523.0, RCR_TIME);
    data.extend_from_slice(&[0xff; 16]);
    data.resize(2 * SIZEOF_SECTOR, 0xff);

    LogImage::from_bytes(data)
}

fn scan(image: &LogImage) -> Vec<ScanItem> {
    LogScanner::new(image, ModelProfile::MTK, false)
        .collect::<Result<Vec<_>, _>>()
        .expect("image decodes cleanly")
}

#[test]
fn decode_two_sector_image() {
    let image = build_image();
    let items = scan(&image);

    let points: Vec<_> = items
        .iter()
        .filter_map(|item| match item {
            ScanItem::Point(p) => Some(p),
            ScanItem::SegmentBreak => None,
        })
        .collect();
    assert_eq!(points.len(), 4);
    assert_eq!(points[2].kind, RecordKind::Waypoint);
    assert_eq!(points[3].kind, RecordKind::TrackPoint);
    assert_eq!(points[3].record.latitude, Some(48.13));
    assert_eq!(points[3].record.utc, DateTime::from_timestamp(1_600_000_030, 0));

    // decoding is deterministic
    assert_eq!(items, scan(&image));
}

#[tokio::test]
async fn emit_gpx_from_image() {
    let image = build_image();
    let items = scan(&image);

    let opts = GpxOptions {
        tracks: true,
        waypoints: true,
        timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
    };
    let mut buf = Vec::new();
    write_gpx(&mut buf, &items, &opts).await.unwrap();
    let doc = String::from_utf8(buf).unwrap();

    assert_eq!(doc.matches("<trkpt ").count(), 3);
    assert_eq!(doc.matches("<wpt ").count(), 1);
    // the unwritten gap in the writing sector closes the only segment
    assert_eq!(doc.matches("<trkseg>").count(), 1);
    assert!(doc.contains("<time>2020-09-13T12:26:40Z</time>"));
    assert!(doc.ends_with("</gpx>\n"));
}
