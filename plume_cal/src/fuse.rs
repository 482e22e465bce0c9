use chrono::Duration;

use crate::{FusedSample, GasSample, LocalTime, Trackpoint};

/// Nearest-timestamp merge of a track and an analyzer stream.
///
/// Both inputs are re-sorted by time. Each timed track point takes the
/// closest analyzer sample if it lies within `tolerance` (inclusive);
/// otherwise the point is dropped. One analyzer sample may serve several
/// track points. On an exact tie the earlier sample wins.
pub fn fuse_streams(
    track: &[Trackpoint],
    gas: &[GasSample],
    tolerance: Duration,
) -> Vec<FusedSample> {
    let mut points: Vec<(LocalTime, &Trackpoint)> = track
        .iter()
        .filter_map(|p| p.timestamp.map(|t| (t, p)))
        .collect();
    points.sort_by_key(|(t, _)| *t);

    let mut samples: Vec<&GasSample> = gas.iter().collect();
    samples.sort_by_key(|s| s.timestamp);

    let mut out = Vec::with_capacity(points.len());
    for (t, point) in points {
        let Some(sample) = nearest(&samples, t) else {
            continue;
        };
        if (sample.timestamp - t).abs() > tolerance {
            continue;
        }
        out.push(FusedSample {
            latitude: point.latitude,
            longitude: point.longitude,
            elevation: point.elevation,
            concentration: sample.concentration,
            timestamp: Some(t),
        });
    }
    out
}

fn nearest<'a>(samples: &[&'a GasSample], t: LocalTime) -> Option<&'a GasSample> {
    let idx = samples.partition_point(|s| s.timestamp < t);
    let before = idx.checked_sub(1).map(|i| samples[i]);
    let after = samples.get(idx).copied();
    match (before, after) {
        (Some(b), Some(a)) => {
            if a.timestamp - t < t - b.timestamp {
                Some(a)
            } else {
                Some(b)
            }
        }
        (Some(b), None) => Some(b),
        (None, after) => after,
    }
}
