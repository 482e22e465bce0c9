//! GPX track ingestion.

use std::io::Cursor;

use chrono::{DateTime, FixedOffset};

use crate::{PlumeError, Trackpoint};

/// Parse every track point of every track segment, in document order.
///
/// Times are converted to `offset`. Points without a `<time>` element are
/// kept with `timestamp: None`; they never fuse with an analyzer sample.
pub fn parse_track(
    input: &[u8],
    source_name: &str,
    offset: FixedOffset,
) -> Result<Vec<Trackpoint>, PlumeError> {
    let mut cursor = Cursor::new(input);
    let gpx = gpx::read(&mut cursor).map_err(|e| PlumeError::malformed(source_name, e.to_string()))?;
    let mut out = Vec::new();

    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let timestamp = match point.time {
                    Some(time) => {
                        let iso = time
                            .format()
                            .map_err(|e| PlumeError::malformed(source_name, e.to_string()))?;
                        let parsed = DateTime::parse_from_rfc3339(&iso).map_err(|e| {
                            PlumeError::malformed(source_name, format!("bad time '{iso}': {e}"))
                        })?;
                        Some(parsed.with_timezone(&offset))
                    }
                    None => None,
                };
                let geo = point.point();
                let (latitude, longitude) = (geo.y(), geo.x());
                if !latitude.is_finite() || !longitude.is_finite() {
                    return Err(PlumeError::malformed(
                        source_name,
                        format!("non-numeric coordinates in track point {}", out.len() + 1),
                    ));
                }
                out.push(Trackpoint {
                    latitude,
                    longitude,
                    elevation: point.elevation.unwrap_or(0.0),
                    timestamp,
                });
            }
        }
    }
    Ok(out)
}
