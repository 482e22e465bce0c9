//! Core GPS / trace-gas fusion and plume calibration library.
//!
//! A survey is a GPX track and an analyzer log recorded during the same walk
//! or drive. The pipeline merges the two on time, derives starting values for
//! the dispersion model from the merged geometry, drops samples without
//! signal and then searches stability class / wind sector combinations for
//! the best inversion.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod analyzer;
pub mod estimate;
pub mod fuse;
pub mod plume;
pub mod search;
pub mod tabular;
pub mod track;

pub use analyzer::{parse_analyzer_log, AnalyzerLog, AnalyzerRecord, Species};
pub use estimate::{estimate_parameters, filter_significant, percentile};
pub use fuse::fuse_streams;
pub use plume::GaussianPlumeScorer;
pub use search::{
    hypotheses, run_search, scorer_rows, Hypothesis, InversionScorer, RejectReason, ScorerRow,
    SearchReport, TrialOutcome, TrialRecord,
};
pub use tabular::{parse_table, ParameterOverrides, TabularSurvey};
pub use track::parse_track;

/// Timestamps are carried in the survey's fixed local offset.
pub type LocalTime = DateTime<FixedOffset>;

#[derive(Error, Debug)]
pub enum PlumeError {
    #[error("malformed input in {source_name}: {reason}")]
    MalformedInput { source_name: String, reason: String },
    #[error("no DATAH header record found in {0}")]
    MissingHeader(String),
    #[error("unsupported species '{0}' (expected CH4, CO2 or H2O)")]
    InvalidSpecies(String),
    #[error(
        "no track point within {tolerance_s}s of an analyzer sample: \
         {track_points} track points ({track_span}), {gas_samples} analyzer samples ({gas_span})"
    )]
    NoOverlap {
        tolerance_s: f64,
        track_points: usize,
        track_span: TimeSpan,
        gas_samples: usize,
        gas_span: TimeSpan,
    },
    #[error(
        "no sample rises above background: {fused} fused samples, \
         background {background:.3}, threshold {threshold:.3}, wind {wind_speed_ms:.2} m/s"
    )]
    InsufficientSignal {
        fused: usize,
        background: f64,
        threshold: f64,
        wind_speed_ms: f64,
    },
    #[error("insufficient data for parameter estimation")]
    InsufficientData,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("inversion failed: {0}")]
    Scorer(String),
}

impl PlumeError {
    pub(crate) fn malformed(source_name: &str, reason: impl Into<String>) -> Self {
        PlumeError::MalformedInput {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }
}

/// First and last timestamp of a stream, used in diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TimeSpan {
    pub first: Option<LocalTime>,
    pub last: Option<LocalTime>,
}

impl TimeSpan {
    pub fn of<I: IntoIterator<Item = LocalTime>>(times: I) -> Self {
        times.into_iter().fold(TimeSpan::default(), |span, t| TimeSpan {
            first: Some(span.first.map_or(t, |f| f.min(t))),
            last: Some(span.last.map_or(t, |l| l.max(t))),
        })
    }

    pub fn seconds(&self) -> Option<f64> {
        match (self.first, self.last) {
            (Some(first), Some(last)) => Some((last - first).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.first, self.last) {
            (Some(first), Some(last)) => write!(
                f,
                "{} .. {}",
                first.format("%Y-%m-%d %H:%M:%S%:z"),
                last.format("%Y-%m-%d %H:%M:%S%:z")
            ),
            _ => f.write_str("no timestamps"),
        }
    }
}

/// Pasquill–Gifford atmospheric stability class.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StabilityClass {
    A,
    B,
    C,
    D,
    E,
}

impl StabilityClass {
    pub const ALL: [StabilityClass; 5] = [
        StabilityClass::A,
        StabilityClass::B,
        StabilityClass::C,
        StabilityClass::D,
        StabilityClass::E,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StabilityClass::A => "A",
            StabilityClass::B => "B",
            StabilityClass::C => "C",
            StabilityClass::D => "D",
            StabilityClass::E => "E",
        }
    }
}

impl Default for StabilityClass {
    fn default() -> Self {
        StabilityClass::D
    }
}

impl fmt::Display for StabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StabilityClass {
    type Err = PlumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        StabilityClass::ALL
            .into_iter()
            .find(|class| class.as_str() == normalized)
            .ok_or_else(|| {
                PlumeError::InvalidParameter(format!("unknown stability class '{normalized}'"))
            })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub merge_tolerance_s: f64,
    pub utc_offset_hours: i32,
    pub background_percentile: f64,
    pub significance_factor: f64,
    pub min_wind_speed_ms: f64,
    pub source_height_m: f64,
    pub stability_order: Vec<StabilityClass>,
    pub sector_half_widths_deg: Vec<f64>,
    pub min_trial_points: usize,
    pub score_floor: f64,
    pub parallel_search: bool,
    pub search_budget_s: Option<f64>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            merge_tolerance_s: 5.0,
            utc_offset_hours: -5,
            background_percentile: 0.10,
            significance_factor: 1.001,
            min_wind_speed_ms: 0.3,
            source_height_m: 2.0,
            stability_order: vec![
                StabilityClass::D,
                StabilityClass::C,
                StabilityClass::B,
                StabilityClass::E,
                StabilityClass::A,
            ],
            sector_half_widths_deg: vec![180.0, 150.0, 120.0, 90.0],
            min_trial_points: 10,
            score_floor: -0.5,
            parallel_search: false,
            search_budget_s: None,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), PlumeError> {
        if !self.merge_tolerance_s.is_finite() || self.merge_tolerance_s < 0.0 {
            return Err(PlumeError::InvalidParameter(format!(
                "merge tolerance must be >= 0 s, got {}",
                self.merge_tolerance_s
            )));
        }
        self.local_offset()?;
        if !(0.0..=1.0).contains(&self.background_percentile) {
            return Err(PlumeError::InvalidParameter(format!(
                "background percentile must lie in [0, 1], got {}",
                self.background_percentile
            )));
        }
        if !self.significance_factor.is_finite() || self.significance_factor <= 0.0 {
            return Err(PlumeError::InvalidParameter(
                "significance factor must be positive".into(),
            ));
        }
        if !self.min_wind_speed_ms.is_finite() || !self.source_height_m.is_finite() {
            return Err(PlumeError::InvalidParameter(
                "wind speed floor and source height must be finite".into(),
            ));
        }
        if self.stability_order.is_empty() {
            return Err(PlumeError::InvalidParameter(
                "at least one stability class is required".into(),
            ));
        }
        if self.sector_half_widths_deg.is_empty()
            || self
                .sector_half_widths_deg
                .iter()
                .any(|w| !(*w > 0.0 && *w <= 180.0))
        {
            return Err(PlumeError::InvalidParameter(
                "sector half-widths must be non-empty and within (0, 180] degrees".into(),
            ));
        }
        if !self.score_floor.is_finite() {
            return Err(PlumeError::InvalidParameter("score floor must be finite".into()));
        }
        if let Some(budget) = self.search_budget_s {
            if !(budget.is_finite() && budget > 0.0) {
                return Err(PlumeError::InvalidParameter(format!(
                    "search budget must be a positive number of seconds, got {budget}"
                )));
            }
        }
        Ok(())
    }

    pub fn local_offset(&self) -> Result<FixedOffset, PlumeError> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| {
            PlumeError::InvalidParameter(format!(
                "UTC offset {}h is out of range",
                self.utc_offset_hours
            ))
        })
    }

    pub fn merge_tolerance(&self) -> Duration {
        Duration::nanoseconds((self.merge_tolerance_s * 1e9).round() as i64)
    }

    pub fn hash_sha256(&self) -> Result<String, PlumeError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| PlumeError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Trackpoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub timestamp: Option<LocalTime>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct GasSample {
    pub timestamp: LocalTime,
    pub concentration: f64,
    pub species: Species,
    pub unit: &'static str,
}

/// One track point paired with its nearest analyzer reading.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FusedSample {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub concentration: f64,
    /// Track point time; absent for rows ingested from a plain table.
    pub timestamp: Option<LocalTime>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EstimatedParameters {
    pub background_concentration: f64,
    pub source_latitude: f64,
    pub source_longitude: f64,
    pub source_height_m: f64,
    pub wind_direction_from_deg: f64,
    pub wind_speed_ms: f64,
    pub stability: StabilityClass,
    pub bearing_to_source_deg: f64,
    pub centroid_latitude: f64,
    pub centroid_longitude: f64,
    pub max_spread_km: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InversionResult {
    pub rate_g_per_s: f64,
    pub rate_g_per_h: f64,
    pub std_g_per_s: f64,
    pub std_g_per_h: f64,
    pub r_squared: f64,
    pub n_points: usize,
    pub stability_used: StabilityClass,
    /// Set only on the fallback result; a zero rate without it is a real fit.
    pub error: Option<String>,
}

impl InversionResult {
    pub fn fallback(n_points: usize, message: impl Into<String>) -> Self {
        Self {
            rate_g_per_s: 0.0,
            rate_g_per_h: 0.0,
            std_g_per_s: 0.0,
            std_g_per_h: 0.0,
            r_squared: 0.0,
            n_points,
            stability_used: StabilityClass::D,
            error: Some(message.into()),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SurveySummary {
    pub samples: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub span: TimeSpan,
    pub species: Option<Species>,
    pub unit: Option<&'static str>,
}

impl SurveySummary {
    pub fn from_samples(samples: &[FusedSample], species: Option<Species>) -> Self {
        let (min, max, sum) = samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(lo, hi, sum), s| (lo.min(s.concentration), hi.max(s.concentration), sum + s.concentration),
        );
        let n = samples.len();
        Self {
            samples: n,
            mean: if n > 0 { sum / n as f64 } else { 0.0 },
            min: if n > 0 { min } else { 0.0 },
            max: if n > 0 { max } else { 0.0 },
            span: TimeSpan::of(samples.iter().filter_map(|s| s.timestamp)),
            species,
            unit: species.map(|s| s.unit()),
        }
    }
}

/// Everything a run produces. Rendering consumes `estimated`, `filtered` and
/// `search.result`; the rest is diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct CalibrationRun {
    pub species: Option<Species>,
    pub trackpoints: usize,
    pub gas_samples: usize,
    pub fused: Vec<FusedSample>,
    pub estimated: EstimatedParameters,
    pub filtered: Vec<FusedSample>,
    pub summary: SurveySummary,
    pub search: SearchReport,
    pub reference_rate_g_per_s: Option<f64>,
    pub params_hash: String,
}

impl CalibrationRun {
    pub fn result(&self) -> &InversionResult {
        &self.search.result
    }
}

/// Run the full GPX + analyzer-log pipeline.
///
/// The species selector is validated before either input is parsed.
pub fn calibrate_survey<S: InversionScorer + ?Sized>(
    track: &[u8],
    track_name: &str,
    log: &str,
    log_name: &str,
    species: &str,
    params: &Params,
    scorer: &S,
) -> Result<CalibrationRun, PlumeError> {
    let species: Species = species.parse()?;
    params.validate()?;
    let offset = params.local_offset()?;

    let trackpoints = parse_track(track, track_name, offset)?;
    let analyzer = parse_analyzer_log(log, log_name, offset)?;
    let gas = analyzer.samples(species, log_name)?;
    info!(
        "Parsed {} track points from {} and {} {} samples from {}",
        trackpoints.len(),
        track_name,
        gas.len(),
        species,
        log_name
    );

    let fused = fuse_streams(&trackpoints, &gas, params.merge_tolerance());
    if fused.is_empty() {
        return Err(PlumeError::NoOverlap {
            tolerance_s: params.merge_tolerance_s,
            track_points: trackpoints.len(),
            track_span: TimeSpan::of(trackpoints.iter().filter_map(|p| p.timestamp)),
            gas_samples: gas.len(),
            gas_span: TimeSpan::of(gas.iter().map(|g| g.timestamp)),
        });
    }
    info!("Fused {} samples", fused.len());

    calibrate_fused(
        fused,
        Some(species),
        trackpoints.len(),
        gas.len(),
        &ParameterOverrides::default(),
        None,
        params,
        scorer,
    )
}

/// Run the tabular (CSV) variant: rows already carry position and
/// concentration, optionally model parameters as well.
pub fn calibrate_table<S: InversionScorer + ?Sized>(
    csv_text: &str,
    source_name: &str,
    species: Option<Species>,
    params: &Params,
    scorer: &S,
) -> Result<CalibrationRun, PlumeError> {
    params.validate()?;
    let table = parse_table(csv_text, source_name)?;
    if table.samples.is_empty() {
        return Err(PlumeError::malformed(source_name, "no usable rows"));
    }
    info!(
        "Loaded {} rows from {} ({} skipped)",
        table.samples.len(),
        source_name,
        table.rows_skipped
    );
    let rows = table.samples.len();
    calibrate_fused(
        table.samples,
        species,
        rows,
        rows,
        &table.overrides,
        table.reference_rate_g_per_s,
        params,
        scorer,
    )
}

#[allow(clippy::too_many_arguments)]
fn calibrate_fused<S: InversionScorer + ?Sized>(
    fused: Vec<FusedSample>,
    species: Option<Species>,
    trackpoints: usize,
    gas_samples: usize,
    overrides: &ParameterOverrides,
    reference_rate_g_per_s: Option<f64>,
    params: &Params,
    scorer: &S,
) -> Result<CalibrationRun, PlumeError> {
    let mut estimated = estimate_parameters(&fused, params)?;
    if !overrides.is_empty() {
        debug!("Applying table parameters over estimates: {:?}", overrides);
        overrides.apply(&mut estimated);
    }
    info!(
        "Estimated background {:.3}, source ({:.6}, {:.6}), wind {:.1} deg @ {:.2} m/s, spread {:.3} km",
        estimated.background_concentration,
        estimated.source_latitude,
        estimated.source_longitude,
        estimated.wind_direction_from_deg,
        estimated.wind_speed_ms,
        estimated.max_spread_km
    );

    let filtered = filter_significant(&fused, &estimated, params);
    if filtered.is_empty() {
        return Err(PlumeError::InsufficientSignal {
            fused: fused.len(),
            background: estimated.background_concentration,
            threshold: estimated.background_concentration * params.significance_factor,
            wind_speed_ms: estimated.wind_speed_ms,
        });
    }
    info!(
        "{} of {} samples above background",
        filtered.len(),
        fused.len()
    );

    let search = run_search(&filtered, &estimated, params, scorer);
    if let Some(message) = search.result.error.as_ref() {
        warn!("Calibration fell back to the default result: {}", message);
    }

    Ok(CalibrationRun {
        species,
        trackpoints,
        gas_samples,
        summary: SurveySummary::from_samples(&fused, species),
        fused,
        estimated,
        filtered,
        search,
        reference_rate_g_per_s,
        params_hash: params.hash_sha256()?,
    })
}
