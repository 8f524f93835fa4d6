//! KML 2.2 output: the track as one styled LineString, waypoints as Point
//! placemarks.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::datalog::scanner::{RecordKind, ScanItem};

const PREAMBLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
<Document>
    <name>Paths</name>
    <description>GPS track log</description>
    <Style id="yellowLineGreenPoly">
        <LineStyle>
            <color>ffb5c5ff</color>
            <width>5</width>
        </LineStyle>
        <PolyStyle>
            <color>ffb5c500</color>
        </PolyStyle>
    </Style>
    <Placemark>
        <name>Track</name>
        <description>Logged track</description>
        <styleUrl>#yellowLineGreenPoly</styleUrl>
        <LineString>
            <altitudeMode>relative</altitudeMode>
            <coordinates>
"#;

const LINESTRING_END: &str = r#"            </coordinates>
        </LineString>
    </Placemark>
"#;

const POSTAMBLE: &str = "</Document>\n</kml>\n";

/// Render `items` as a KML document.
pub async fn write_kml<W: AsyncWrite + Unpin>(
    writer: &mut W,
    items: &[ScanItem],
) -> std::io::Result<()> {
    let mut doc = String::from(PREAMBLE);
    let mut waypoints = String::new();
    let mut wpt_count = 0u32;

    for item in items {
        let ScanItem::Point(point) = item else {
            continue;
        };
        let record = &point.record;
        let (Some(lat), Some(lon)) = (record.latitude, record.longitude) else {
            continue;
        };
        let height = record.height.unwrap_or(0.0);
        match point.kind {
            RecordKind::TrackPoint => {
                doc.push_str(&format!("            {lon:.9},{lat:.9},{height:.1}\n"));
            }
            RecordKind::Waypoint => {
                wpt_count += 1;
                waypoints.push_str("    <Placemark>\n");
                waypoints.push_str(&format!("        <name>WP{wpt_count:06}</name>\n"));
                waypoints.push_str("        <Point>\n");
                waypoints.push_str(&format!(
                    "            <coordinates>{lon:.9},{lat:.9},{height:.1}</coordinates>\n"
                ));
                waypoints.push_str("        </Point>\n");
                waypoints.push_str("    </Placemark>\n");
            }
        }
    }

    doc.push_str(LINESTRING_END);
    doc.push_str(&waypoints);
    doc.push_str(POSTAMBLE);

    writer.write_all(doc.as_bytes()).await?;
    writer.flush().await
}
