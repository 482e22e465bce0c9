//! Trace-gas analyzer log ingestion (LI-7810 style `.data` files).
//!
//! The file is tab delimited: a free-form `key:\tvalue` preamble, one `DATAH`
//! record naming the columns, one `DATAU` record with units, then `DATA`
//! records. Timestamps are written in the instrument's local time.

use std::fmt;
use std::str::FromStr;

use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{GasSample, LocalTime, PlumeError};

const HEADER_TAG: &str = "DATAH";
const DATA_TAG: &str = "DATA\t";
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Molar volume of an ideal gas at 25 °C and 1 atm, litres.
const MOLAR_VOLUME_L: f64 = 24.45;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Species {
    #[serde(rename = "CH4")]
    Ch4,
    #[serde(rename = "CO2")]
    Co2,
    #[serde(rename = "H2O")]
    H2o,
}

impl Species {
    pub const ALL: [Species; 3] = [Species::Ch4, Species::Co2, Species::H2o];

    /// Column name in the analyzer log.
    pub fn column(&self) -> &'static str {
        match self {
            Species::Ch4 => "CH4",
            Species::Co2 => "CO2",
            Species::H2o => "H2O",
        }
    }

    /// Display unit as written by the instrument.
    pub fn unit(&self) -> &'static str {
        match self {
            Species::Ch4 => "ppb",
            Species::Co2 | Species::H2o => "ppm",
        }
    }

    pub fn molar_mass_g_per_mol(&self) -> f64 {
        match self {
            Species::Ch4 => 16.04,
            Species::Co2 => 44.01,
            Species::H2o => 18.015,
        }
    }

    pub fn grams_per_m3_per_ppm(&self) -> f64 {
        self.molar_mass_g_per_mol() / MOLAR_VOLUME_L * 1e-3
    }

    /// Mass concentration (g/m³) represented by one instrument unit.
    pub fn grams_per_m3_per_unit(&self) -> f64 {
        let per_ppm = self.grams_per_m3_per_ppm();
        match self.unit() {
            "ppb" => per_ppm * 1e-3,
            _ => per_ppm,
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for Species {
    type Err = PlumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        Species::ALL
            .into_iter()
            .find(|sp| sp.column() == normalized)
            .ok_or_else(|| PlumeError::InvalidSpecies(s.to_string()))
    }
}

/// One `DATA` record. Unparsable numeric fields are `None`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AnalyzerRecord {
    pub timestamp: Option<LocalTime>,
    pub seconds: Option<f64>,
    pub h2o: Option<f64>,
    pub co2: Option<f64>,
    pub ch4: Option<f64>,
}

impl AnalyzerRecord {
    pub fn value(&self, species: Species) -> Option<f64> {
        match species {
            Species::Ch4 => self.ch4,
            Species::Co2 => self.co2,
            Species::H2o => self.h2o,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalyzerLog {
    /// `key: value` lines preceding the header (model, serial number, ...).
    pub metadata: Vec<(String, String)>,
    pub columns: Vec<String>,
    pub records: Vec<AnalyzerRecord>,
}

impl AnalyzerLog {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Gas samples for one species; records lacking a timestamp or a value
    /// are dropped.
    pub fn samples(&self, species: Species, source_name: &str) -> Result<Vec<GasSample>, PlumeError> {
        if !self.has_column(species.column()) {
            return Err(PlumeError::malformed(
                source_name,
                format!("column {} not present in header", species.column()),
            ));
        }
        let samples: Vec<GasSample> = self
            .records
            .iter()
            .filter_map(|r| {
                Some(GasSample {
                    timestamp: r.timestamp?,
                    concentration: r.value(species)?,
                    species,
                    unit: species.unit(),
                })
            })
            .collect();
        debug!(
            "{}: {} of {} records carry a timestamped {} value",
            source_name,
            samples.len(),
            self.records.len(),
            species
        );
        Ok(samples)
    }
}

/// Parse the whole log. `DATE`/`TIME` are read as local wall-clock time and
/// stamped with `offset`; no conversion happens.
pub fn parse_analyzer_log(
    text: &str,
    source_name: &str,
    offset: FixedOffset,
) -> Result<AnalyzerLog, PlumeError> {
    let lines: Vec<&str> = text.lines().collect();
    let header_idx = lines
        .iter()
        .position(|line| line.starts_with(HEADER_TAG))
        .ok_or_else(|| PlumeError::MissingHeader(source_name.to_string()))?;

    let metadata = lines[..header_idx]
        .iter()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect();

    let columns: Vec<String> = lines[header_idx]
        .trim_end()
        .split('\t')
        .skip(1)
        .map(|c| c.trim().to_string())
        .collect();
    let index_of = |name: &str| columns.iter().position(|c| c == name);
    let date_idx = index_of("DATE")
        .ok_or_else(|| PlumeError::malformed(source_name, "header has no DATE column"))?;
    let time_idx = index_of("TIME")
        .ok_or_else(|| PlumeError::malformed(source_name, "header has no TIME column"))?;
    let seconds_idx = index_of("SECONDS");
    let h2o_idx = index_of("H2O");
    let co2_idx = index_of("CO2");
    let ch4_idx = index_of("CH4");

    // The record right after DATAH is the units row.
    let mut records = Vec::new();
    for line in lines.iter().skip(header_idx + 2) {
        if !line.starts_with(DATA_TAG) {
            continue;
        }
        let fields: Vec<&str> = line.trim_end().split('\t').skip(1).collect();
        let numeric = |idx: Option<usize>| idx.and_then(|i| fields.get(i)).and_then(|v| parse_numeric(v));
        let timestamp = match (fields.get(date_idx), fields.get(time_idx)) {
            (Some(date), Some(time)) => parse_local_timestamp(date, time, offset),
            _ => None,
        };
        records.push(AnalyzerRecord {
            timestamp,
            seconds: numeric(seconds_idx),
            h2o: numeric(h2o_idx),
            co2: numeric(co2_idx),
            ch4: numeric(ch4_idx),
        });
    }
    debug!(
        "{}: header at line {}, {} columns, {} DATA records",
        source_name,
        header_idx + 1,
        columns.len(),
        records.len()
    );

    Ok(AnalyzerLog {
        metadata,
        columns,
        records,
    })
}

fn parse_numeric(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_local_timestamp(date: &str, time: &str, offset: FixedOffset) -> Option<LocalTime> {
    let joined = format!("{} {}", date.trim(), time.trim());
    DATE_FORMATS.iter().find_map(|date_fmt| {
        let naive = NaiveDateTime::parse_from_str(&joined, &format!("{date_fmt} %H:%M:%S%.f")).ok()?;
        offset.from_local_datetime(&naive).single()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn bogota() -> FixedOffset {
        FixedOffset::west_opt(5 * 3600).unwrap()
    }

    const LOG: &str = "Model:\tLI-7810\n\
SN:\tTG10-01072\n\
Timezone:\tAmerica/Bogota\n\
DATAH\tSECONDS\tNANOSECONDS\tDIAG\tREMARK\tDATE\tTIME\tH2O\tCO2\tCH4\n\
DATAU\ts\tns\t\t\tdate\ttime\tppm\tppm\tppb\n\
DATA\t1715353200\t0\t0\t\t2024-05-10\t10:00:00\t9050.1\t421.7\t2001.5\n\
DATA\t1715353201\t0\t0\t\t2024-05-10\t10:00:01.5\t9051.0\tnan\t2004.0\n\
DATA\t1715353202\t0\t0\t\t2024-05-10\t10:00:02\t9049.8\t422.0\t--\n\
DATA\t1715353203\t0\t0\t\tbad-date\t10:00:03\t9049.8\t422.0\t2010.0\n\
REMARK\tsomething the operator typed\n";

    #[test]
    fn species_selector() {
        assert_eq!("ch4".parse::<Species>().unwrap(), Species::Ch4);
        assert_eq!(" CO2 ".parse::<Species>().unwrap(), Species::Co2);
        assert!(matches!(
            "N2O".parse::<Species>(),
            Err(PlumeError::InvalidSpecies(s)) if s == "N2O"
        ));
        assert_eq!(Species::Ch4.unit(), "ppb");
        assert_eq!(Species::Co2.unit(), "ppm");
        assert_eq!(Species::H2o.unit(), "ppm");
    }

    #[test]
    fn mass_conversion_scales_ppb() {
        let ch4 = Species::Ch4.grams_per_m3_per_unit();
        assert!((ch4 - 16.04 / 24.45 * 1e-6).abs() < 1e-12);
        let co2 = Species::Co2.grams_per_m3_per_unit();
        assert!((co2 - 44.01 / 24.45 * 1e-3).abs() < 1e-12);
    }

    #[test]
    fn parses_header_metadata_and_records() {
        let log = parse_analyzer_log(LOG, "survey.data", bogota()).unwrap();
        assert_eq!(log.metadata_value("model"), Some("LI-7810"));
        assert_eq!(log.metadata_value("SN"), Some("TG10-01072"));
        assert_eq!(log.columns[0], "SECONDS");
        assert!(log.has_column("CH4"));
        assert_eq!(log.records.len(), 4);
        assert_eq!(log.records[0].seconds, Some(1715353200.0));
        assert_eq!(log.records[1].co2, None);
        assert_eq!(log.records[2].ch4, None);
        assert_eq!(log.records[3].timestamp, None);
    }

    #[test]
    fn timestamps_are_stamped_not_converted() {
        let log = parse_analyzer_log(LOG, "survey.data", bogota()).unwrap();
        let t0 = log.records[0].timestamp.unwrap();
        assert_eq!(t0.hour(), 10);
        assert_eq!(t0.offset().local_minus_utc(), -5 * 3600);
        let t1 = log.records[1].timestamp.unwrap();
        assert_eq!((t1 - t0).num_milliseconds(), 1500);
    }

    #[test]
    fn samples_drop_incomplete_rows() {
        let log = parse_analyzer_log(LOG, "survey.data", bogota()).unwrap();
        let ch4 = log.samples(Species::Ch4, "survey.data").unwrap();
        assert_eq!(ch4.len(), 2);
        assert_eq!(ch4[0].concentration, 2001.5);
        assert_eq!(ch4[1].unit, "ppb");
        let co2 = log.samples(Species::Co2, "survey.data").unwrap();
        assert_eq!(co2.len(), 2);
        assert_eq!(co2[1].concentration, 422.0);
    }

    #[test]
    fn missing_header_is_a_format_error() {
        let text = "Model:\tLI-7810\nDATA\t1\t2\n";
        assert!(matches!(
            parse_analyzer_log(text, "x.data", bogota()),
            Err(PlumeError::MissingHeader(name)) if name == "x.data"
        ));
    }

    #[test]
    fn missing_species_column_is_malformed() {
        let text = "DATAH\tDATE\tTIME\tCO2\nDATAU\tdate\ttime\tppm\nDATA\t2024-05-10\t10:00:00\t420\n";
        let log = parse_analyzer_log(text, "x.data", bogota()).unwrap();
        assert!(matches!(
            log.samples(Species::Ch4, "x.data"),
            Err(PlumeError::MalformedInput { .. })
        ));
    }

    #[test]
    fn alternate_date_layouts() {
        let offset = bogota();
        assert!(parse_local_timestamp("2024/05/10", "10:00:00", offset).is_some());
        assert!(parse_local_timestamp("05/10/2024", "10:00:00.250", offset).is_some());
        assert!(parse_local_timestamp("10.05.2024", "10:00:00", offset).is_none());
    }
}
