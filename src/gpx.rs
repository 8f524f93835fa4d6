//! GPX 1.1 output for a scanned record sequence. Waypoints become `<wpt>`
//! elements, trackpoints a single `<trk>` whose `<trkseg>` boundaries
//! follow the scanner's segment breaks.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::datalog::record::LogRecord;
use crate::datalog::scanner::{RecordKind, ScanItem};

#[derive(Debug, Clone)]
pub struct GpxOptions {
    pub tracks: bool,
    pub waypoints: bool,
    /// Stamped into `<metadata><time>`; injected so the same record
    /// sequence always yields the same bytes.
    pub timestamp: DateTime<Utc>,
}

fn point_time(record: &LogRecord) -> Option<String> {
    let utc = record.utc?;
    Some(match record.millisecond {
        Some(ms) => (utc + Duration::milliseconds(i64::from(ms)))
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        None => utc.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

fn push_point(out: &mut String, tag: &str, lat: f64, lon: f64, record: &LogRecord) {
    out.push_str(&format!("<{tag} lat=\"{lat:.9}\" lon=\"{lon:.9}\">\n"));
    if let Some(height) = record.height {
        out.push_str(&format!("  <ele>{height:.6}</ele>\n"));
    }
    if let Some(time) = point_time(record) {
        out.push_str(&format!("  <time>{time}</time>\n"));
    }
}

/// Render `items` as a GPX 1.1 document.
pub async fn write_gpx<W: AsyncWrite + Unpin>(
    writer: &mut W,
    items: &[ScanItem],
    opts: &GpxOptions,
) -> std::io::Result<()> {
    let mut waypoints = String::new();
    let mut track = String::new();
    let mut wpt_count = 0u32;
    let mut in_segment = false;

    for item in items {
        match item {
            ScanItem::Point(point) => {
                let record = &point.record;
                let (Some(lat), Some(lon)) = (record.latitude, record.longitude) else {
                    continue;
                };
                match point.kind {
                    RecordKind::Waypoint if opts.waypoints => {
                        wpt_count += 1;
                        push_point(&mut waypoints, "wpt", lat, lon, record);
                        waypoints.push_str(&format!("  <name>WP{wpt_count:06}</name>\n</wpt>\n"));
                    }
                    RecordKind::TrackPoint if opts.tracks => {
                        if !in_segment {
                            track.push_str("<trkseg>\n");
                            in_segment = true;
                        }
                        push_point(&mut track, "trkpt", lat, lon, record);
                        track.push_str("</trkpt>\n");
                    }
                    _ => {}
                }
            }
            ScanItem::SegmentBreak => {
                if in_segment {
                    track.push_str("</trkseg>\n");
                    in_segment = false;
                }
            }
        }
    }
    if in_segment {
        track.push_str("</trkseg>\n");
    }

    let mut doc = String::new();
    doc.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    doc.push_str(&format!(
        "<gpx version=\"1.1\" creator=\"{} {}\" xmlns=\"http://www.topografix.com/GPX/1/1\">\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    ));
    doc.push_str(&format!(
        "<metadata><time>{}</time></metadata>\n",
        opts.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    doc.push_str(&waypoints);
    if !track.is_empty() {
        doc.push_str("<trk>\n<name>Track log</name>\n");
        doc.push_str(&track);
        doc.push_str("</trk>\n");
    }
    doc.push_str("</gpx>\n");

    writer.write_all(doc.as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::scanner::TaggedRecord;

    fn point(kind: RecordKind, lat: f64, lon: f64, secs: i64) -> ScanItem {
        ScanItem::Point(TaggedRecord {
            kind,
            record: LogRecord {
                utc: DateTime::from_timestamp(secs, 0),
                latitude: Some(lat),
                longitude: Some(lon),
                height: Some(120.5),
                ..LogRecord::default()
            },
        })
    }

    fn options() -> GpxOptions {
        GpxOptions {
            tracks: true,
            waypoints: true,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_segment_breaks_split_track() {
        let items = vec![
            point(RecordKind::TrackPoint, 48.1, 11.5, 1_600_000_000),
            point(RecordKind::TrackPoint, 48.2, 11.6, 1_600_000_010),
            ScanItem::SegmentBreak,
            point(RecordKind::TrackPoint, 48.3, 11.7, 1_600_000_060),
        ];
        let mut buf = Vec::new();
        write_gpx(&mut buf, &items, &options()).await.unwrap();
        let doc = String::from_utf8(buf).unwrap();

        assert_eq!(doc.matches("<trkseg>").count(), 2);
        assert_eq!(doc.matches("</trkseg>").count(), 2);
        assert_eq!(doc.matches("<trkpt ").count(), 3);
        assert!(doc.contains("<time>2020-09-13T12:26:40Z</time>"));
    }

    #[tokio::test]
    async fn test_waypoints_precede_track() {
        let items = vec![
            point(RecordKind::TrackPoint, 48.1, 11.5, 1_600_000_000),
            point(RecordKind::Waypoint, 48.2, 11.6, 1_600_000_010),
        ];
        let mut buf = Vec::new();
        write_gpx(&mut buf, &items, &options()).await.unwrap();
        let doc = String::from_utf8(buf).unwrap();

        let wpt = doc.find("<wpt ").unwrap();
        let trk = doc.find("<trk>").unwrap();
        assert!(wpt < trk, "waypoints must come before tracks");
        assert!(doc.contains("<name>WP000001</name>"));
    }

    #[tokio::test]
    async fn test_emission_is_deterministic() {
        let items = vec![
            point(RecordKind::Waypoint, 48.1, 11.5, 1_600_000_000),
            ScanItem::SegmentBreak,
            point(RecordKind::TrackPoint, 48.2, 11.6, 1_600_000_010),
        ];
        let opts = options();
        let mut first = Vec::new();
        write_gpx(&mut first, &items, &opts).await.unwrap();
        let mut second = Vec::new();
        write_gpx(&mut second, &items, &opts).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_tracks_only_drops_waypoints() {
        let items = vec![
            point(RecordKind::Waypoint, 48.1, 11.5, 1_600_000_000),
            point(RecordKind::TrackPoint, 48.2, 11.6, 1_600_000_010),
        ];
        let mut buf = Vec::new();
        let opts = GpxOptions {
            waypoints: false,
            ..options()
        };
        write_gpx(&mut buf, &items, &opts).await.unwrap();
        let doc = String::from_utf8(buf).unwrap();
        assert!(!doc.contains("<wpt "));
        assert_eq!(doc.matches("<trkpt ").count(), 1);
    }
}
