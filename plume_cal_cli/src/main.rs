use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use plume_cal::{
    calibrate_survey, calibrate_table, fuse_streams, parse_analyzer_log, parse_track, scorer_rows,
    CalibrationRun, EstimatedParameters, GaussianPlumeScorer, Hypothesis, InversionResult, Params,
    Species, SurveySummary, TimeSpan, TrialRecord,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "GPS / trace-gas plume calibration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fuse a GPX track with an analyzer log and estimate the emission rate
    Calibrate(CalibrateArgs),
    /// Estimate the emission rate from a CSV of positioned concentrations
    Table(TableArgs),
    /// Inspect a track / analyzer log pair without running the inversion
    Diagnose(DiagnoseArgs),
}

#[derive(Parser, Debug)]
struct CalibrateArgs {
    /// GPX track recorded during the survey
    #[arg(value_hint = ValueHint::FilePath)]
    track: PathBuf,

    /// Analyzer `.data` log recorded during the survey
    #[arg(value_hint = ValueHint::FilePath)]
    log: PathBuf,

    /// Gas to calibrate (CH4, CO2 or H2O)
    #[arg(long, default_value = "CH4")]
    species: String,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Parser, Debug)]
struct TableArgs {
    /// CSV with lat / lon / concentration columns (English or Spanish headers)
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Gas in the concentration column, read as ppm
    #[arg(long, default_value = "CH4")]
    species: String,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON report path (`-` for stdout)
    #[arg(short, long, default_value = "calibration.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// JSON parameter file; flags below override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Max |Δt| in seconds when pairing track points with analyzer samples
    #[arg(long, allow_hyphen_values = true)]
    tolerance: Option<f64>,

    /// Fixed local UTC offset of the analyzer clock, in hours
    #[arg(long, allow_hyphen_values = true)]
    utc_offset: Option<i32>,

    /// Run the hypothesis grid on all cores
    #[arg(long, action = ArgAction::SetTrue)]
    parallel: bool,

    /// Wall-clock budget for the hypothesis grid, seconds
    #[arg(long)]
    budget: Option<f64>,

    /// Receptor (inlet) height above ground, metres
    #[arg(long, default_value_t = 1.0)]
    receptor_height: f64,

    /// Write the fused samples that passed the significance filter as CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    samples_csv: Option<PathBuf>,

    /// Write the scorer input table as CSV
    #[arg(long, value_hint = ValueHint::FilePath)]
    scorer_table: Option<PathBuf>,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DiagnoseArgs {
    /// GPX track
    #[arg(value_hint = ValueHint::FilePath)]
    track: PathBuf,

    /// Analyzer `.data` log
    #[arg(value_hint = ValueHint::FilePath)]
    log: PathBuf,

    /// JSON parameter file (tolerance and UTC offset are used)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Output report path
    #[arg(short, long, default_value = "survey_diagnostics.txt", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Calibrate(args) => args.run.verbose,
        Command::Table(args) => args.run.verbose,
        Command::Diagnose(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Calibrate(args) => handle_calibrate(args),
        Command::Table(args) => handle_table(args),
        Command::Diagnose(args) => handle_diagnose(args),
    }
}

fn load_params(config: Option<&Path>) -> Result<Params> {
    let Some(path) = config else {
        return Ok(Params::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a valid parameter file", path.display()))
}

fn resolve_params(run: &RunArgs) -> Result<Params> {
    let mut params = load_params(run.config.as_deref())?;
    if let Some(tolerance) = run.tolerance {
        params.merge_tolerance_s = tolerance;
    }
    if let Some(offset) = run.utc_offset {
        params.utc_offset_hours = offset;
    }
    if run.parallel {
        params.parallel_search = true;
    }
    if run.budget.is_some() {
        params.search_budget_s = run.budget;
    }
    params.validate()?;
    Ok(params)
}

fn handle_calibrate(args: CalibrateArgs) -> Result<()> {
    let params = resolve_params(&args.run)?;
    let species: Species = args.species.parse()?;
    let scorer = GaussianPlumeScorer::for_species(species).with_receptor_height(args.run.receptor_height);

    let t_read = Instant::now();
    let track = fs::read(&args.track)
        .with_context(|| format!("failed to read {}", args.track.display()))?;
    let log = fs::read_to_string(&args.log)
        .with_context(|| format!("failed to read {}", args.log.display()))?;
    if args.run.profile {
        info!("Read stage: {:.1} ms", t_read.elapsed().as_secs_f64() * 1000.0);
    }

    let t_run = Instant::now();
    let run = calibrate_survey(
        &track,
        &display_name(&args.track),
        &log,
        &display_name(&args.log),
        &args.species,
        &params,
        &scorer,
    )
    .with_context(|| {
        format!(
            "calibration failed for {} + {}",
            args.track.display(),
            args.log.display()
        )
    })?;
    if args.run.profile {
        info!(
            "Calibration stage: {:.1} ms ({} trials)",
            t_run.elapsed().as_secs_f64() * 1000.0,
            run.search.trials.len()
        );
    }

    let inputs = vec![args.track.clone(), args.log.clone()];
    finish(&run, &params, inputs, &args.run)
}

fn handle_table(args: TableArgs) -> Result<()> {
    let params = resolve_params(&args.run)?;
    let species: Species = args.species.parse()?;
    let scorer = GaussianPlumeScorer::new(species.grams_per_m3_per_ppm())
        .with_receptor_height(args.run.receptor_height);

    let text = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let t_run = Instant::now();
    let run = calibrate_table(&text, &display_name(&args.input), None, &params, &scorer)
        .with_context(|| format!("calibration failed for {}", args.input.display()))?;
    if args.run.profile {
        info!(
            "Calibration stage: {:.1} ms ({} trials)",
            t_run.elapsed().as_secs_f64() * 1000.0,
            run.search.trials.len()
        );
    }

    finish(&run, &params, vec![args.input.clone()], &args.run)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[derive(Serialize)]
struct Report<'a> {
    generated_at: String,
    tool_version: &'static str,
    inputs: Vec<String>,
    params: &'a Params,
    params_hash: &'a str,
    summary: &'a SurveySummary,
    trackpoints: usize,
    gas_samples: usize,
    fused_samples: usize,
    filtered_samples: usize,
    estimated: &'a EstimatedParameters,
    result: &'a InversionResult,
    best: Option<Hypothesis>,
    accepted_trials: usize,
    reference_rate_g_per_s: Option<f64>,
    trials: &'a [TrialRecord],
}

fn finish(run: &CalibrationRun, params: &Params, inputs: Vec<PathBuf>, args: &RunArgs) -> Result<()> {
    log_result(run);

    let report = Report {
        generated_at: Utc::now().to_rfc3339(),
        tool_version: env!("CARGO_PKG_VERSION"),
        inputs: inputs.iter().map(|p| p.display().to_string()).collect(),
        params,
        params_hash: &run.params_hash,
        summary: &run.summary,
        trackpoints: run.trackpoints,
        gas_samples: run.gas_samples,
        fused_samples: run.fused.len(),
        filtered_samples: run.filtered.len(),
        estimated: &run.estimated,
        result: run.result(),
        best: run.search.best,
        accepted_trials: run.search.accepted(),
        reference_rate_g_per_s: run.reference_rate_g_per_s,
        trials: &run.search.trials,
    };
    let json = serde_json::to_string_pretty(&report)?;
    if args.output.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{json}")?;
    } else {
        fs::write(&args.output, json)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Wrote report: {}", args.output.display());
    }

    if let Some(path) = args.samples_csv.as_ref() {
        write_samples_csv(run, path)?;
        info!("Wrote samples: {} ({} rows)", path.display(), run.filtered.len());
    }
    if let Some(path) = args.scorer_table.as_ref() {
        write_scorer_table(run, path)?;
        info!("Wrote scorer table: {}", path.display());
    }
    Ok(())
}

fn log_result(run: &CalibrationRun) {
    let result = run.result();
    if let Some(err) = result.error.as_deref() {
        warn!("No usable fit: {}", err);
        return;
    }
    info!(
        "{} of {} hypotheses accepted",
        run.search.accepted(),
        run.search.trials.len()
    );
    info!(
        "Emission rate {:.3} g/s ({:.1} ± {:.1} g/h), R2 {:.3}, n {}, stability {}",
        result.rate_g_per_s,
        result.rate_g_per_h,
        result.std_g_per_h,
        result.r_squared,
        result.n_points,
        result.stability_used
    );
    if let Some(reference) = run.reference_rate_g_per_s {
        if reference != 0.0 {
            info!(
                "Reference rate {:.3} g/s, deviation {:+.1}%",
                reference,
                (result.rate_g_per_s - reference) / reference * 100.0
            );
        }
    }
}

fn write_samples_csv(run: &CalibrationRun, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([
        "timestamp",
        "latitude",
        "longitude",
        "elevation_m",
        "concentration",
        "excess",
    ])?;
    let background = run.estimated.background_concentration;
    for sample in &run.filtered {
        writer.write_record([
            sample.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default(),
            format!("{:.7}", sample.latitude),
            format!("{:.7}", sample.longitude),
            format!("{:.1}", sample.elevation),
            format!("{:.4}", sample.concentration),
            format!("{:.4}", sample.concentration - background),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_scorer_table(run: &CalibrationRun, path: &Path) -> Result<()> {
    let mut params = run.estimated.clone();
    params.stability = run.result().stability_used;
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    for row in scorer_rows(&run.filtered, &params) {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Default, Clone)]
struct ColumnStats {
    count: usize,
    min: Option<f64>,
    max: Option<f64>,
}

impl ColumnStats {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.count += 1;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }
}

fn handle_diagnose(args: DiagnoseArgs) -> Result<()> {
    let params = load_params(args.config.as_deref())?;
    params.validate()?;
    let offset = params.local_offset()?;
    let mut report = String::new();

    let data = fs::read(&args.track)
        .with_context(|| format!("failed to read {}", args.track.display()))?;
    let track = parse_track(&data, &display_name(&args.track), offset)
        .with_context(|| format!("failed to parse {}", args.track.display()))?;
    let track_span = TimeSpan::of(track.iter().filter_map(|p| p.timestamp));
    let untimed = track.iter().filter(|p| p.timestamp.is_none()).count();

    report.push_str(&format!("TRACK: {}\n", args.track.display()));
    report.push_str(&format!("  points: {}\n", track.len()));
    report.push_str(&format!("  without time: {}\n", untimed));
    report.push_str(&format!("  span: {}\n", track_span));
    if let Some(seconds) = track_span.seconds() {
        report.push_str(&format!("  timespan_s: {:.1}\n", seconds));
    }
    report.push('\n');

    let text = fs::read_to_string(&args.log)
        .with_context(|| format!("failed to read {}", args.log.display()))?;
    let log = parse_analyzer_log(&text, &display_name(&args.log), offset)
        .with_context(|| format!("failed to parse {}", args.log.display()))?;
    let log_span = TimeSpan::of(log.records.iter().filter_map(|r| r.timestamp));

    report.push_str(&format!("LOG: {}\n", args.log.display()));
    report.push_str(&format!(
        "  instrument: {} (SN {})\n",
        log.metadata_value("Model").unwrap_or("unknown"),
        log.metadata_value("SN").unwrap_or("n/a")
    ));
    report.push_str(&format!("  records: {}\n", log.records.len()));
    report.push_str(&format!("  span: {}\n", log_span));
    if !log.metadata.is_empty() {
        report.push_str("  metadata:\n");
        for (key, value) in &log.metadata {
            report.push_str(&format!("    - {}: {}\n", key, value));
        }
    }
    report.push_str(&format!("  columns: {}\n", log.columns.join(", ")));

    let mut stats: BTreeMap<&str, ColumnStats> = BTreeMap::new();
    for record in &log.records {
        stats.entry("SECONDS").or_default().push(record.seconds);
        for species in Species::ALL {
            stats.entry(species.column()).or_default().push(record.value(species));
        }
    }
    report.push_str("  numeric columns:\n");
    for (name, summary) in &stats {
        report.push_str(&format!(
            "    - {}: count={}, min={}, max={}\n",
            name,
            summary.count,
            summary.min.map_or("n/a".into(), |v| format!("{:.3}", v)),
            summary.max.map_or("n/a".into(), |v| format!("{:.3}", v))
        ));
    }
    report.push('\n');

    report.push_str("ALIGNMENT:\n");
    if let (Some(track_start), Some(log_start)) = (track_span.first, log_span.first) {
        report.push_str(&format!(
            "  log start - track start: {:+.1} s\n",
            (log_start - track_start).num_milliseconds() as f64 / 1000.0
        ));
    }
    for species in Species::ALL {
        if !log.has_column(species.column()) {
            continue;
        }
        let samples = log.samples(species, &display_name(&args.log))?;
        let fused = fuse_streams(&track, &samples, params.merge_tolerance());
        report.push_str(&format!(
            "  {}: {} samples, {} fused within {} s\n",
            species,
            samples.len(),
            fused.len(),
            params.merge_tolerance_s
        ));
    }
    if track_span.first.is_some() && log_span.first.is_some() && track_span.last < log_span.first {
        report.push_str("  note: track ends before the log starts; check --utc-offset\n");
    }

    fs::write(&args.output, report)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!("Diagnostic report written: {}", args.output.display());
    Ok(())
}
