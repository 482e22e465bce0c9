//! Starting values for the dispersion model and the significance filter.
//!
//! Everything here is a deterministic heuristic over the fused sample set:
//! the hottest reading is taken as the source, the survey centroid is assumed
//! to sit downwind of it, and a wider spatial spread is read as faster
//! advection.

use std::cmp::Reverse;

use ndarray::{s, Array1, Array2, Axis};
use ordered_float::OrderedFloat;

use crate::{EstimatedParameters, FusedSample, Params, PlumeError, StabilityClass};

/// Flat-earth conversion used for the spread heuristic.
pub const KM_PER_DEGREE: f64 = 111.0;
const WIND_SPEED_MIN_MS: f64 = 1.0;
const WIND_SPEED_MAX_MS: f64 = 8.0;
const WIND_SPEED_PER_KM: f64 = 5.0;

/// Percentile with linear interpolation between order statistics.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by_key(|v| OrderedFloat(*v));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn estimate_parameters(
    samples: &[FusedSample],
    params: &Params,
) -> Result<EstimatedParameters, PlumeError> {
    if samples.is_empty() {
        return Err(PlumeError::InsufficientData);
    }
    let concentrations: Array1<f64> = samples.iter().map(|s| s.concentration).collect();
    let background = concentrations
        .as_slice()
        .and_then(|c| percentile(c, params.background_percentile))
        .ok_or(PlumeError::InsufficientData)?;

    // min_by_key keeps the first of equal maxima.
    let hottest = samples
        .iter()
        .min_by_key(|s| Reverse(OrderedFloat(s.concentration)))
        .ok_or(PlumeError::InsufficientData)?;

    let lats: Array1<f64> = samples.iter().map(|s| s.latitude).collect();
    let lons: Array1<f64> = samples.iter().map(|s| s.longitude).collect();
    let centroid_lat = lats.mean().ok_or(PlumeError::InsufficientData)?;
    let centroid_lon = lons.mean().ok_or(PlumeError::InsufficientData)?;

    let bearing = bearing_deg(
        hottest.latitude - centroid_lat,
        hottest.longitude - centroid_lon,
    );
    let wind_from = (bearing + 180.0) % 360.0;

    let spread_km = max_pairwise_spread_deg(samples) * KM_PER_DEGREE;
    let wind_speed = (WIND_SPEED_MIN_MS + spread_km * WIND_SPEED_PER_KM)
        .clamp(WIND_SPEED_MIN_MS, WIND_SPEED_MAX_MS);

    Ok(EstimatedParameters {
        background_concentration: background,
        source_latitude: hottest.latitude,
        source_longitude: hottest.longitude,
        source_height_m: params.source_height_m,
        wind_direction_from_deg: wind_from,
        wind_speed_ms: wind_speed,
        stability: StabilityClass::default(),
        bearing_to_source_deg: bearing,
        centroid_latitude: centroid_lat,
        centroid_longitude: centroid_lon,
        max_spread_km: spread_km,
    })
}

/// Compass bearing (0 = north, clockwise) of a (Δlat, Δlon) vector, in [0, 360).
pub fn bearing_deg(dlat: f64, dlon: f64) -> f64 {
    (dlon.atan2(dlat).to_degrees() + 360.0) % 360.0
}

/// Largest Euclidean distance between any two samples, in degrees.
fn max_pairwise_spread_deg(samples: &[FusedSample]) -> f64 {
    let n = samples.len();
    let coords = Array2::from_shape_fn((n, 2), |(i, j)| {
        if j == 0 {
            samples[i].latitude
        } else {
            samples[i].longitude
        }
    });
    (0..n).fold(0.0_f64, |best, i| {
        let offsets = &coords.slice(s![i + 1.., ..]) - &coords.row(i);
        offsets
            .map_axis(Axis(1), |d| d.dot(&d).sqrt())
            .fold(best, |acc, &dist| acc.max(dist))
    })
}

/// Keep samples with a detectable excess over background, provided the
/// estimated wind is strong enough for a steady plume.
pub fn filter_significant(
    samples: &[FusedSample],
    estimated: &EstimatedParameters,
    params: &Params,
) -> Vec<FusedSample> {
    if estimated.wind_speed_ms <= params.min_wind_speed_ms {
        return Vec::new();
    }
    let threshold = estimated.background_concentration * params.significance_factor;
    samples
        .iter()
        .filter(|s| s.concentration > threshold)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lat: f64, lon: f64, c: f64) -> FusedSample {
        FusedSample {
            latitude: lat,
            longitude: lon,
            elevation: 0.0,
            concentration: c,
            timestamp: None,
        }
    }

    fn line(n: usize, peak: usize) -> Vec<FusedSample> {
        (0..n)
            .map(|i| {
                let d = i as f64 - peak as f64;
                sample(
                    4.6 + i as f64 * 1e-5,
                    -74.08 + i as f64 * 2e-5,
                    2.0 + 48.0 * (-(d / 8.0).powi(2)).exp(),
                )
            })
            .collect()
    }

    #[test]
    fn percentile_interpolates() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert!((percentile(&values, 0.10).unwrap() - 1.9).abs() < 1e-12);
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 1.0), Some(10.0));
        assert_eq!(percentile(&[3.0], 0.1), Some(3.0));
        assert_eq!(percentile(&[], 0.1), None);
    }

    #[test]
    fn source_is_first_hottest_sample() {
        let mut samples = line(30, 12);
        samples[20].concentration = samples[12].concentration;
        let est = estimate_parameters(&samples, &Params::default()).unwrap();
        assert_eq!(est.source_latitude, samples[12].latitude);
        assert_eq!(est.source_longitude, samples[12].longitude);
        assert_eq!(est.source_height_m, 2.0);
        assert_eq!(est.stability, StabilityClass::D);
    }

    #[test]
    fn wind_blows_from_opposite_of_source_bearing() {
        for peak in [0, 7, 15, 29] {
            let est = estimate_parameters(&line(30, peak), &Params::default()).unwrap();
            let diff = (est.wind_direction_from_deg - est.bearing_to_source_deg).rem_euclid(360.0);
            assert!((diff - 180.0).abs() < 1e-9, "peak {peak}: diff {diff}");
            assert!((0.0..360.0).contains(&est.wind_direction_from_deg));
        }
    }

    #[test]
    fn bearing_follows_compass_convention() {
        assert!((bearing_deg(1.0, 0.0) - 0.0).abs() < 1e-12);
        assert!((bearing_deg(0.0, 1.0) - 90.0).abs() < 1e-12);
        assert!((bearing_deg(-1.0, 0.0) - 180.0).abs() < 1e-12);
        assert!((bearing_deg(0.0, -1.0) - 270.0).abs() < 1e-12);
    }

    #[test]
    fn source_north_of_centroid_means_southerly_wind() {
        let samples = vec![
            sample(4.600, -74.0, 2.0),
            sample(4.601, -74.0, 2.1),
            sample(4.602, -74.0, 9.0),
        ];
        let est = estimate_parameters(&samples, &Params::default()).unwrap();
        assert!((est.bearing_to_source_deg - 0.0).abs() < 1e-9);
        assert!((est.wind_direction_from_deg - 180.0).abs() < 1e-9);
    }

    #[test]
    fn wind_speed_heuristic_is_clamped() {
        // 0.002 deg apart -> 0.222 km -> 1 + 1.11 m/s
        let near = vec![sample(4.600, -74.0, 2.0), sample(4.602, -74.0, 3.0)];
        let est = estimate_parameters(&near, &Params::default()).unwrap();
        assert!((est.max_spread_km - 0.222).abs() < 1e-9);
        assert!((est.wind_speed_ms - 2.11).abs() < 1e-9);

        let far = vec![sample(4.6, -74.0, 2.0), sample(4.7, -74.1, 3.0)];
        let est = estimate_parameters(&far, &Params::default()).unwrap();
        assert_eq!(est.wind_speed_ms, 8.0);

        let single = vec![sample(4.6, -74.0, 2.0)];
        let est = estimate_parameters(&single, &Params::default()).unwrap();
        assert_eq!(est.wind_speed_ms, 1.0);
        assert_eq!(est.max_spread_km, 0.0);
    }

    #[test]
    fn spread_is_the_widest_pair() {
        let samples = vec![
            sample(0.0, 0.0, 1.0),
            sample(0.3, 0.4, 1.0),
            sample(0.1, 0.0, 1.0),
            sample(-0.3, -0.4, 1.0),
        ];
        assert!((max_pairwise_spread_deg(&samples) - 1.0).abs() < 1e-12);
        assert_eq!(max_pairwise_spread_deg(&samples[..1]), 0.0);
        assert_eq!(max_pairwise_spread_deg(&[]), 0.0);
    }

    #[test]
    fn background_never_rises_when_adding_low_sample() {
        let params = Params::default();
        let mut samples = line(40, 20);
        for step in 0..10 {
            let before = estimate_parameters(&samples, &params)
                .unwrap()
                .background_concentration;
            samples.push(sample(4.59, -74.1, before - 0.1 * (step as f64 + 1.0)));
            let after = estimate_parameters(&samples, &params)
                .unwrap()
                .background_concentration;
            assert!(after <= before, "{after} > {before}");
        }
    }

    #[test]
    fn estimation_is_deterministic() {
        let samples = line(50, 33);
        let a = estimate_parameters(&samples, &Params::default()).unwrap();
        let b = estimate_parameters(&samples, &Params::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            estimate_parameters(&[], &Params::default()),
            Err(PlumeError::InsufficientData)
        ));
    }

    #[test]
    fn filter_requires_excess_and_wind() {
        let params = Params::default();
        let samples = vec![
            sample(4.6, -74.0, 2.0),
            sample(4.6, -74.0, 2.002),
            sample(4.6, -74.0, 2.0021),
            sample(4.6, -74.0, 5.0),
        ];
        let mut est = estimate_parameters(&samples, &params).unwrap();
        est.background_concentration = 2.0;
        let kept = filter_significant(&samples, &est, &params);
        let values: Vec<f64> = kept.iter().map(|s| s.concentration).collect();
        assert_eq!(values, vec![2.0021, 5.0]);

        est.wind_speed_ms = 0.3;
        assert!(filter_significant(&samples, &est, &params).is_empty());
    }

    #[test]
    fn flat_signal_has_nothing_above_background() {
        let samples: Vec<FusedSample> = (0..20)
            .map(|i| sample(4.6 + i as f64 * 1e-5, -74.0, 2.0))
            .collect();
        let params = Params::default();
        let est = estimate_parameters(&samples, &params).unwrap();
        assert!(filter_significant(&samples, &est, &params).is_empty());
    }
}
