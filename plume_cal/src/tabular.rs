//! CSV surveys whose rows already carry position and concentration.
//!
//! Field sheets come with English or Spanish headers; every header is mapped
//! onto a canonical column once, through [`COLUMN_ALIASES`].

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{EstimatedParameters, FusedSample, PlumeError, StabilityClass};

/// Canonical column and the headers accepted for it, canonical name first.
pub const COLUMN_ALIASES: &[(&str, &[&str])] = &[
    ("lat", &["lat", "latitude", "latitud"]),
    ("lon", &["lon", "longitude", "longitud"]),
    ("z_m", &["z_m", "z", "altura", "height"]),
    (
        "ch4_ppm",
        &["ch4_ppm", "ch4", "metano", "concentration", "gas_concentration"],
    ),
    ("background_ppm", &["background_ppm", "background", "fondo"]),
    ("wind_speed_ms", &["wind_speed_ms", "wind_speed", "velocidad_viento"]),
    (
        "wind_dir_from_deg",
        &["wind_dir_from_deg", "wind_dir", "direccion_viento"],
    ),
    ("stability", &["stability", "estabilidad"]),
    ("source_lat", &["source_lat", "lat_fuente"]),
    ("source_lon", &["source_lon", "lon_fuente"]),
    ("source_height_m", &["source_height_m", "altura_fuente"]),
    ("q_true_gps", &["q_true_gps", "q_true"]),
];

const REQUIRED: [&str; 3] = ["lat", "lon", "ch4_ppm"];

/// Canonical name for a raw header, if it is one we know.
pub fn canonical_column(header: &str) -> Option<&'static str> {
    let header = header.trim().to_lowercase();
    COLUMN_ALIASES
        .iter()
        .find(|(_, aliases)| aliases.iter().any(|a| *a == header))
        .map(|(canonical, _)| *canonical)
}

/// Model parameters supplied by the table instead of estimated from geometry.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ParameterOverrides {
    pub background_concentration: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub wind_direction_from_deg: Option<f64>,
    pub stability: Option<StabilityClass>,
    pub source_latitude: Option<f64>,
    pub source_longitude: Option<f64>,
    pub source_height_m: Option<f64>,
}

impl ParameterOverrides {
    pub fn is_empty(&self) -> bool {
        *self == ParameterOverrides::default()
    }

    pub fn apply(&self, estimated: &mut EstimatedParameters) {
        if let Some(v) = self.background_concentration {
            estimated.background_concentration = v;
        }
        if let Some(v) = self.wind_speed_ms {
            estimated.wind_speed_ms = v;
        }
        if let Some(v) = self.wind_direction_from_deg {
            estimated.wind_direction_from_deg = v.rem_euclid(360.0);
            estimated.bearing_to_source_deg = (v + 180.0).rem_euclid(360.0);
        }
        if let Some(v) = self.stability {
            estimated.stability = v;
        }
        if let Some(v) = self.source_latitude {
            estimated.source_latitude = v;
        }
        if let Some(v) = self.source_longitude {
            estimated.source_longitude = v;
        }
        if let Some(v) = self.source_height_m {
            estimated.source_height_m = v;
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TabularSurvey {
    pub samples: Vec<FusedSample>,
    pub overrides: ParameterOverrides,
    /// Known release rate from a controlled test, for comparison.
    pub reference_rate_g_per_s: Option<f64>,
    pub rows_skipped: usize,
}

pub fn parse_table(text: &str, source_name: &str) -> Result<TabularSurvey, PlumeError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| PlumeError::malformed(source_name, e.to_string()))?
        .clone();

    let columns = resolve_columns(headers.iter());
    debug!("{}: column mapping {:?}", source_name, columns);
    for required in REQUIRED {
        if !columns.contains_key(required) {
            return Err(PlumeError::malformed(
                source_name,
                format!("missing required column '{required}'"),
            ));
        }
    }

    let mut samples = Vec::new();
    let mut overrides = ParameterOverrides::default();
    let mut reference_rate = None;
    let mut rows_skipped = 0;

    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| PlumeError::malformed(source_name, e.to_string()))?;
        let field = |name: &str| {
            columns
                .get(name)
                .and_then(|&idx| record.get(idx))
                .filter(|v| !v.is_empty())
        };
        let number = |name: &str| field(name).and_then(|v| v.parse::<f64>().ok()).filter(|v| v.is_finite());

        let (Some(latitude), Some(longitude), Some(concentration)) =
            (number("lat"), number("lon"), number("ch4_ppm"))
        else {
            debug!("{}: skipping row {}", source_name, i + 2);
            rows_skipped += 1;
            continue;
        };
        samples.push(FusedSample {
            latitude,
            longitude,
            elevation: number("z_m").unwrap_or(0.0),
            concentration,
            timestamp: None,
        });

        fill(&mut overrides.background_concentration, number("background_ppm"));
        fill(&mut overrides.wind_speed_ms, number("wind_speed_ms"));
        fill(&mut overrides.wind_direction_from_deg, number("wind_dir_from_deg"));
        fill(&mut overrides.source_latitude, number("source_lat"));
        fill(&mut overrides.source_longitude, number("source_lon"));
        fill(&mut overrides.source_height_m, number("source_height_m"));
        fill(&mut reference_rate, number("q_true_gps"));
        if overrides.stability.is_none() {
            if let Some(raw) = field("stability") {
                match raw.parse() {
                    Ok(class) => overrides.stability = Some(class),
                    Err(err) => warn!("{}: row {}: {}", source_name, i + 2, err),
                }
            }
        }
    }

    Ok(TabularSurvey {
        samples,
        overrides,
        reference_rate_g_per_s: reference_rate,
        rows_skipped,
    })
}

/// Keeps the first value seen.
fn fill(slot: &mut Option<f64>, value: Option<f64>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Canonical column -> field index. An exact canonical header beats an
/// alias; otherwise the first matching header wins.
fn resolve_columns<'a>(headers: impl Iterator<Item = &'a str>) -> HashMap<&'static str, usize> {
    let mut exact = HashMap::new();
    let mut aliased = HashMap::new();
    for (idx, header) in headers.enumerate() {
        let Some(canonical) = canonical_column(header) else {
            continue;
        };
        let slot = if header.trim().eq_ignore_ascii_case(canonical) {
            &mut exact
        } else {
            &mut aliased
        };
        slot.entry(canonical).or_insert(idx);
    }
    for (canonical, idx) in aliased {
        exact.entry(canonical).or_insert(idx);
    }
    exact
}
