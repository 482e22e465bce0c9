//! Grid search over stability class and wind-sector half-width.
//!
//! Every hypothesis is handed to an [`InversionScorer`]; each trial ends as a
//! [`TrialOutcome`] and the selected result is a fold over those outcomes in
//! enumeration order, so sequential and parallel runs pick the same winner.

use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    EstimatedParameters, FusedSample, InversionResult, Params, PlumeError, StabilityClass,
};

/// The plume inversion seen from the search: given samples, parameters with
/// the trial's stability stamped in, and a sector half-width, estimate a rate.
pub trait InversionScorer: Sync {
    fn invert(
        &self,
        samples: &[FusedSample],
        params: &EstimatedParameters,
        sector_half_width_deg: f64,
    ) -> Result<InversionResult, PlumeError>;
}

impl<F> InversionScorer for F
where
    F: Fn(&[FusedSample], &EstimatedParameters, f64) -> Result<InversionResult, PlumeError> + Sync,
{
    fn invert(
        &self,
        samples: &[FusedSample],
        params: &EstimatedParameters,
        sector_half_width_deg: f64,
    ) -> Result<InversionResult, PlumeError> {
        self(samples, params, sector_half_width_deg)
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
pub struct Hypothesis {
    pub stability: StabilityClass,
    pub sector_half_width_deg: f64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    TooFewPoints { n_points: usize, required: usize },
    ScoreBelowFloor { r_squared: f64, floor: f64 },
    NonFiniteScore,
    ScorerFailed { message: String },
    BudgetExhausted,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TrialOutcome {
    Accepted(InversionResult),
    Rejected(RejectReason),
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TrialRecord {
    pub hypothesis: Hypothesis,
    pub outcome: TrialOutcome,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SearchReport {
    pub result: InversionResult,
    /// `None` when the fallback result was returned.
    pub best: Option<Hypothesis>,
    pub trials: Vec<TrialRecord>,
}

impl SearchReport {
    pub fn accepted(&self) -> usize {
        self.trials
            .iter()
            .filter(|t| matches!(t.outcome, TrialOutcome::Accepted(_)))
            .count()
    }
}

/// Stability classes in preference order, each with every sector width.
pub fn hypotheses(params: &Params) -> Vec<Hypothesis> {
    params
        .stability_order
        .iter()
        .flat_map(|&stability| {
            params
                .sector_half_widths_deg
                .iter()
                .map(move |&width| Hypothesis {
                    stability,
                    sector_half_width_deg: width,
                })
        })
        .collect()
}

pub fn run_search<S: InversionScorer + ?Sized>(
    samples: &[FusedSample],
    estimated: &EstimatedParameters,
    params: &Params,
    scorer: &S,
) -> SearchReport {
    let grid = hypotheses(params);
    let started = Instant::now();
    let budget = params.search_budget_s.map(Duration::from_secs_f64);

    let run_trial = |hypothesis: &Hypothesis| -> TrialRecord {
        let outcome = if budget.is_some_and(|b| started.elapsed() >= b) {
            TrialOutcome::Rejected(RejectReason::BudgetExhausted)
        } else {
            let mut trial_params = estimated.clone();
            trial_params.stability = hypothesis.stability;
            let result = scorer.invert(samples, &trial_params, hypothesis.sector_half_width_deg);
            classify(hypothesis, result, params)
        };
        TrialRecord {
            hypothesis: *hypothesis,
            outcome,
        }
    };

    let trials: Vec<TrialRecord> = if params.parallel_search {
        grid.par_iter().map(run_trial).collect()
    } else {
        grid.iter().map(run_trial).collect()
    };
    debug!(
        "Search finished {} trials in {:.1} ms",
        trials.len(),
        started.elapsed().as_secs_f64() * 1000.0
    );

    select(trials, samples.len())
}

fn classify(
    hypothesis: &Hypothesis,
    result: Result<InversionResult, PlumeError>,
    params: &Params,
) -> TrialOutcome {
    let result = match result {
        Ok(result) => result,
        Err(err) => {
            warn!(
                "Stability={} sector={} deg: scorer failed: {}",
                hypothesis.stability, hypothesis.sector_half_width_deg, err
            );
            return TrialOutcome::Rejected(RejectReason::ScorerFailed {
                message: err.to_string(),
            });
        }
    };
    debug!(
        "Stability={} sector={} deg -> R2={:.3}, n={}, Q={:.1} g/h",
        hypothesis.stability,
        hypothesis.sector_half_width_deg,
        result.r_squared,
        result.n_points,
        result.rate_g_per_h
    );
    if result.n_points < params.min_trial_points {
        TrialOutcome::Rejected(RejectReason::TooFewPoints {
            n_points: result.n_points,
            required: params.min_trial_points,
        })
    } else if !result.r_squared.is_finite() {
        TrialOutcome::Rejected(RejectReason::NonFiniteScore)
    } else if result.r_squared < params.score_floor {
        TrialOutcome::Rejected(RejectReason::ScoreBelowFloor {
            r_squared: result.r_squared,
            floor: params.score_floor,
        })
    } else {
        TrialOutcome::Accepted(result)
    }
}

fn select(trials: Vec<TrialRecord>, sample_count: usize) -> SearchReport {
    // Strictly greater replaces, so the first of equal scores stays.
    let best = trials
        .iter()
        .fold(None::<(&TrialRecord, &InversionResult)>, |best, trial| {
            match (&trial.outcome, best) {
                (TrialOutcome::Accepted(r), Some((_, b))) if r.r_squared <= b.r_squared => best,
                (TrialOutcome::Accepted(r), _) => Some((trial, r)),
                (TrialOutcome::Rejected(_), _) => best,
            }
        });

    let (result, hypothesis) = match best {
        Some((trial, result)) => {
            info!(
                "Best fit: R2={:.3}, stability={}, sector={} deg, Q={:.1} g/h",
                result.r_squared,
                trial.hypothesis.stability,
                trial.hypothesis.sector_half_width_deg,
                result.rate_g_per_h
            );
            (result.clone(), Some(trial.hypothesis))
        }
        None => (
            InversionResult::fallback(sample_count, fallback_message(&trials)),
            None,
        ),
    };

    SearchReport {
        result,
        best: hypothesis,
        trials,
    }
}

fn fallback_message(trials: &[TrialRecord]) -> String {
    let mut too_few = 0;
    let mut below = 0;
    let mut failed = 0;
    let mut skipped = 0;
    let mut last_error: Option<&str> = None;
    for trial in trials {
        if let TrialOutcome::Rejected(reason) = &trial.outcome {
            match reason {
                RejectReason::TooFewPoints { .. } => too_few += 1,
                RejectReason::ScoreBelowFloor { .. } | RejectReason::NonFiniteScore => below += 1,
                RejectReason::ScorerFailed { message } => {
                    failed += 1;
                    last_error = Some(message);
                }
                RejectReason::BudgetExhausted => skipped += 1,
            }
        }
    }
    let mut message = format!(
        "no hypothesis produced an acceptable fit ({} trials: {} with too few points, \
         {} below the score floor, {} scorer failures, {} over budget)",
        trials.len(),
        too_few,
        below,
        failed,
        skipped
    );
    if let Some(err) = last_error {
        message.push_str("; last error: ");
        message.push_str(err);
    }
    message
}

/// One row of the tabular sample set handed to an external inversion.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ScorerRow {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub concentration: f64,
    pub background: f64,
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub stability_class: StabilityClass,
    pub source_latitude: f64,
    pub source_longitude: f64,
    pub source_height: f64,
}

pub fn scorer_rows(samples: &[FusedSample], params: &EstimatedParameters) -> Vec<ScorerRow> {
    samples
        .iter()
        .map(|s| ScorerRow {
            latitude: s.latitude,
            longitude: s.longitude,
            elevation: s.elevation,
            concentration: s.concentration,
            background: params.background_concentration,
            wind_speed: params.wind_speed_ms,
            wind_direction: params.wind_direction_from_deg,
            stability_class: params.stability,
            source_latitude: params.source_latitude,
            source_longitude: params.source_longitude,
            source_height: params.source_height_m,
        })
        .collect()
}
