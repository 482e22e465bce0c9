//! Reference inversion: steady-state Gaussian plume with ground reflection.
//!
//! Each usable sample contributes one equation `excess = Q * p`, where `p` is
//! the modelled concentration for a unit release. Q is the least-squares
//! slope through the origin.

use std::f64::consts::PI;

use crate::estimate::bearing_deg;
use crate::search::InversionScorer;
use crate::{EstimatedParameters, FusedSample, InversionResult, PlumeError, Species, StabilityClass};

const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Samples this close to the source are inside the model's singularity.
const MIN_SOURCE_DISTANCE_M: f64 = 1.0;

/// Briggs open-country dispersion coefficients (σy, σz) in metres at
/// downwind distance `x` metres.
pub fn briggs_rural_sigmas(stability: StabilityClass, x: f64) -> (f64, f64) {
    let lateral = (1.0 + 0.0001 * x).powf(-0.5) * x;
    match stability {
        StabilityClass::A => (0.22 * lateral, 0.20 * x),
        StabilityClass::B => (0.16 * lateral, 0.12 * x),
        StabilityClass::C => (0.11 * lateral, 0.08 * x * (1.0 + 0.0002 * x).powf(-0.5)),
        StabilityClass::D => (0.08 * lateral, 0.06 * x * (1.0 + 0.0015 * x).powf(-0.5)),
        StabilityClass::E => (0.06 * lateral, 0.03 * x / (1.0 + 0.0003 * x)),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GaussianPlumeScorer {
    /// g/m³ represented by one unit of the measured concentration.
    pub grams_per_m3_per_unit: f64,
    pub receptor_height_m: f64,
    pub min_points: usize,
}

impl Default for GaussianPlumeScorer {
    /// Methane in ppm, the unit of tabular surveys.
    fn default() -> Self {
        Self::new(Species::Ch4.grams_per_m3_per_ppm())
    }
}

impl GaussianPlumeScorer {
    pub fn new(grams_per_m3_per_unit: f64) -> Self {
        Self {
            grams_per_m3_per_unit,
            receptor_height_m: 1.0,
            min_points: 3,
        }
    }

    /// Scorer for concentrations in the analyzer's native unit.
    pub fn for_species(species: Species) -> Self {
        Self::new(species.grams_per_m3_per_unit())
    }

    pub fn with_receptor_height(mut self, height_m: f64) -> Self {
        self.receptor_height_m = height_m;
        self
    }

    /// Concentration (g/m³) at a receptor for a 1 g/s release at the source.
    /// Zero upwind of the source.
    pub fn unit_response(&self, params: &EstimatedParameters, latitude: f64, longitude: f64) -> f64 {
        let (east, north) = local_offset_m(params, latitude, longitude);
        let (downwind, crosswind) = rotate_to_plume(params, east, north);
        self.response(params, downwind, crosswind)
    }

    fn response(&self, params: &EstimatedParameters, downwind: f64, crosswind: f64) -> f64 {
        if downwind <= 0.0 {
            return 0.0;
        }
        let (sy, sz) = briggs_rural_sigmas(params.stability, downwind);
        let h = params.source_height_m;
        let z = self.receptor_height_m;
        let lateral = (-crosswind * crosswind / (2.0 * sy * sy)).exp();
        let vertical = (-(z - h).powi(2) / (2.0 * sz * sz)).exp()
            + (-(z + h).powi(2) / (2.0 * sz * sz)).exp();
        lateral * vertical / (2.0 * PI * params.wind_speed_ms * sy * sz)
    }
}

/// East / north offset in metres from the source, on the local tangent plane.
fn local_offset_m(params: &EstimatedParameters, latitude: f64, longitude: f64) -> (f64, f64) {
    let north = (latitude - params.source_latitude).to_radians() * EARTH_RADIUS_M;
    let east = (longitude - params.source_longitude).to_radians()
        * EARTH_RADIUS_M
        * params.source_latitude.to_radians().cos();
    (east, north)
}

fn plume_axis_deg(params: &EstimatedParameters) -> f64 {
    (params.wind_direction_from_deg + 180.0).rem_euclid(360.0)
}

/// (downwind, crosswind) distance for an east / north offset.
fn rotate_to_plume(params: &EstimatedParameters, east: f64, north: f64) -> (f64, f64) {
    let (sin, cos) = plume_axis_deg(params).to_radians().sin_cos();
    (east * sin + north * cos, north * sin - east * cos)
}

/// Smallest absolute angle between two compass bearings.
fn angular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

impl InversionScorer for GaussianPlumeScorer {
    fn invert(
        &self,
        samples: &[FusedSample],
        params: &EstimatedParameters,
        sector_half_width_deg: f64,
    ) -> Result<InversionResult, PlumeError> {
        if !(params.wind_speed_ms > 0.0) {
            return Err(PlumeError::Scorer(format!(
                "wind speed must be positive, got {}",
                params.wind_speed_ms
            )));
        }
        let axis = plume_axis_deg(params);

        let mut predicted = Vec::with_capacity(samples.len());
        let mut observed = Vec::with_capacity(samples.len());
        for sample in samples {
            let (east, north) = local_offset_m(params, sample.latitude, sample.longitude);
            if east.hypot(north) < MIN_SOURCE_DISTANCE_M {
                continue;
            }
            if angular_distance(bearing_deg(north, east), axis) > sector_half_width_deg {
                continue;
            }
            let (downwind, crosswind) = rotate_to_plume(params, east, north);
            predicted.push(self.response(params, downwind, crosswind));
            observed.push(
                (sample.concentration - params.background_concentration) * self.grams_per_m3_per_unit,
            );
        }

        let n = predicted.len();
        if n < self.min_points {
            return Err(PlumeError::Scorer(format!(
                "only {} samples inside the {} deg sector (need {})",
                n, sector_half_width_deg, self.min_points
            )));
        }
        let sum_pp: f64 = predicted.iter().map(|p| p * p).sum();
        if sum_pp <= 0.0 {
            return Err(PlumeError::Scorer(
                "no sample lies downwind of the source".into(),
            ));
        }
        let sum_pe: f64 = predicted.iter().zip(&observed).map(|(p, e)| p * e).sum();
        let q = sum_pe / sum_pp;

        let mean = observed.iter().sum::<f64>() / n as f64;
        let (ss_res, ss_tot) = predicted.iter().zip(&observed).fold((0.0, 0.0), |(res, tot), (p, e)| {
            (res + (e - q * p).powi(2), tot + (e - mean).powi(2))
        });
        // A constant excess has no variance to explain; the search rejects NaN.
        let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { f64::NAN };
        let std = (ss_res / (n - 1) as f64 / sum_pp).sqrt();

        Ok(InversionResult {
            rate_g_per_s: q,
            rate_g_per_h: q * 3600.0,
            std_g_per_s: std,
            std_g_per_h: std * 3600.0,
            r_squared,
            n_points: n,
            stability_used: params.stability,
            error: None,
        })
    }
}
