use plume_cal::{
    calibrate_survey, calibrate_table, EstimatedParameters, FusedSample, GaussianPlumeScorer,
    InversionResult, Params, PlumeError, Species, StabilityClass, TrialOutcome,
};

const POINTS: usize = 100;
const PEAK: usize = 60;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn lat(i: usize) -> f64 {
    4.6 + i as f64 * 1e-5
}

fn lon(i: usize) -> f64 {
    -74.08 + i as f64 * 1e-5
}

/// 1 Hz track starting 2024-05-10 15:00:00 UTC, shifted by `shift_s`.
fn gpx(shift_s: usize) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <gpx version=\"1.1\" creator=\"test\" xmlns=\"http://www.topografix.com/GPX/1/1\">\n\
         <trk><trkseg>\n",
    );
    for i in 0..POINTS {
        let t = i + shift_s;
        out.push_str(&format!(
            "<trkpt lat=\"{:.6}\" lon=\"{:.6}\"><ele>2600.0</ele><time>2024-05-10T{:02}:{:02}:{:02}Z</time></trkpt>\n",
            lat(i),
            lon(i),
            15 + t / 3600,
            (t / 60) % 60,
            t % 60
        ));
    }
    out.push_str("</trkseg></trk></gpx>\n");
    out
}

fn plume_ppb(i: usize) -> f64 {
    let d = (i as f64 - PEAK as f64) / 8.0;
    2.0 + 48.0 * (-d * d).exp()
}

/// Analyzer log in local time (UTC-5), one record per second.
fn analyzer_log(value: impl Fn(usize) -> f64) -> String {
    let mut out = String::from(
        "Model:\tLI-7810\n\
         SN:\tTG10-01072\n\
         DATAH\tSECONDS\tNANOSECONDS\tDATE\tTIME\tH2O\tCO2\tCH4\n\
         DATAU\ts\tns\tdate\ttime\tppm\tppm\tppb\n",
    );
    for i in 0..POINTS {
        out.push_str(&format!(
            "DATA\t{}\t0\t2024-05-10\t10:{:02}:{:02}\t9000.0\t420.0\t{}\n",
            1_715_353_200 + i,
            i / 60,
            i % 60,
            value(i)
        ));
    }
    out
}

fn stub_scorer(
    samples: &[FusedSample],
    params: &EstimatedParameters,
    width: f64,
) -> Result<InversionResult, PlumeError> {
    let rate = 0.02 * samples.len() as f64;
    Ok(InversionResult {
        rate_g_per_s: rate,
        rate_g_per_h: rate * 3600.0,
        std_g_per_s: 0.01,
        std_g_per_h: 36.0,
        r_squared: 0.5 + width / 1000.0,
        n_points: samples.len(),
        stability_used: params.stability,
        error: None,
    })
}

fn rejecting_scorer(
    samples: &[FusedSample],
    params: &EstimatedParameters,
    _width: f64,
) -> Result<InversionResult, PlumeError> {
    let mut result = stub_scorer(samples, params, 0.0)?;
    result.r_squared = -0.9;
    Ok(result)
}

#[test]
fn end_to_end_synthetic_survey() {
    init_tracing();
    let run = calibrate_survey(
        gpx(0).as_bytes(),
        "walk.gpx",
        &analyzer_log(plume_ppb),
        "walk.data",
        "CH4",
        &Params::default(),
        &stub_scorer,
    )
    .unwrap();

    assert_eq!(run.trackpoints, POINTS);
    assert_eq!(run.gas_samples, POINTS);
    assert_eq!(run.fused.len(), POINTS);
    assert!((run.estimated.background_concentration - 2.0).abs() < 1e-3);
    assert!((run.estimated.source_latitude - lat(PEAK)).abs() < 1e-9);
    assert!((run.estimated.source_longitude - lon(PEAK)).abs() < 1e-9);
    assert_eq!(run.estimated.source_height_m, 2.0);
    assert!(run.filtered.len() >= 10 && run.filtered.len() < POINTS);
    assert!(run
        .filtered
        .iter()
        .all(|s| s.concentration > run.estimated.background_concentration * 1.001));

    let result = run.result();
    assert!(!result.is_fallback());
    assert_eq!(result.stability_used, StabilityClass::D);
    assert_eq!(result.n_points, run.filtered.len());
    assert_eq!(run.search.trials.len(), 20);
    assert_eq!(run.search.best.unwrap().sector_half_width_deg, 180.0);

    assert_eq!(run.summary.samples, POINTS);
    assert_eq!(run.summary.unit, Some("ppb"));
    assert!((run.summary.max - 50.0).abs() < 1e-9);
    assert_eq!(run.summary.span.seconds(), Some(99.0));
    assert_eq!(run.params_hash.len(), 64);
}

#[test]
fn disjoint_time_ranges_report_no_overlap() {
    let err = calibrate_survey(
        gpx(3600).as_bytes(),
        "late.gpx",
        &analyzer_log(plume_ppb),
        "walk.data",
        "CH4",
        &Params::default(),
        &stub_scorer,
    )
    .unwrap_err();
    match err {
        PlumeError::NoOverlap {
            track_points,
            gas_samples,
            track_span,
            gas_span,
            ..
        } => {
            assert_eq!(track_points, POINTS);
            assert_eq!(gas_samples, POINTS);
            assert!(track_span.first > gas_span.last);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn flat_signal_is_insufficient() {
    let err = calibrate_survey(
        gpx(0).as_bytes(),
        "walk.gpx",
        &analyzer_log(|_| 2.0),
        "walk.data",
        "CH4",
        &Params::default(),
        &stub_scorer,
    )
    .unwrap_err();
    match err {
        PlumeError::InsufficientSignal {
            fused, background, ..
        } => {
            assert_eq!(fused, POINTS);
            assert_eq!(background, 2.0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn species_is_checked_before_parsing() {
    let err = calibrate_survey(
        b"not xml",
        "broken.gpx",
        "",
        "empty.data",
        "N2O",
        &Params::default(),
        &stub_scorer,
    )
    .unwrap_err();
    assert!(matches!(err, PlumeError::InvalidSpecies(s) if s == "N2O"));
}

#[test]
fn selection_is_deterministic_across_modes() {
    let track = gpx(0);
    let log = analyzer_log(plume_ppb);
    let run = |params: &Params| {
        calibrate_survey(
            track.as_bytes(),
            "walk.gpx",
            &log,
            "walk.data",
            "ch4",
            params,
            &GaussianPlumeScorer::for_species(Species::Ch4),
        )
        .unwrap()
    };
    let sequential = run(&Params::default());
    let again = run(&Params::default());
    let parallel = run(&Params {
        parallel_search: true,
        ..Params::default()
    });
    assert_eq!(sequential.search, again.search);
    assert_eq!(sequential.search, parallel.search);
    assert_eq!(sequential.estimated, parallel.estimated);
    assert_ne!(sequential.params_hash, parallel.params_hash);
}

#[test]
fn reference_scorer_finds_a_fit() {
    let run = calibrate_survey(
        gpx(0).as_bytes(),
        "walk.gpx",
        &analyzer_log(plume_ppb),
        "walk.data",
        "CH4",
        &Params::default(),
        &GaussianPlumeScorer::for_species(Species::Ch4),
    )
    .unwrap();
    let result = run.result();
    assert!(run.search.best.is_some(), "fell back: {:?}", result.error);
    assert!(!result.is_fallback());
    assert!(result.r_squared >= -0.5);
    assert!(result.n_points >= 10);
    assert!(result.rate_g_per_s.is_finite() && result.rate_g_per_s > 0.0);
    assert!((result.rate_g_per_h - result.rate_g_per_s * 3600.0).abs() < 1e-6);
    assert!(run.search.accepted() > 0);
}

#[test]
fn all_rejected_trials_fall_back() {
    let run = calibrate_survey(
        gpx(0).as_bytes(),
        "walk.gpx",
        &analyzer_log(plume_ppb),
        "walk.data",
        "CH4",
        &Params::default(),
        &rejecting_scorer,
    )
    .unwrap();
    let result = run.result();
    assert!(result.is_fallback());
    assert!(!result.error.as_deref().unwrap_or_default().is_empty());
    assert_eq!(result.r_squared, 0.0);
    assert_eq!(result.rate_g_per_h, 0.0);
    assert_eq!(result.n_points, run.filtered.len());
    assert_eq!(result.stability_used, StabilityClass::D);
    assert!(run
        .search
        .trials
        .iter()
        .all(|t| matches!(t.outcome, TrialOutcome::Rejected(_))));
}

#[test]
fn table_survey_uses_supplied_parameters() {
    let mut csv = String::from("latitud,longitud,metano,velocidad_viento,direccion_viento,estabilidad,q_true\n");
    for i in 0..40 {
        let d = (i as f64 - 25.0) / 5.0;
        csv.push_str(&format!(
            "{:.6},{:.6},{:.4},{},{},{},{}\n",
            lat(i),
            lon(i),
            1.9 + 3.0 * (-d * d).exp(),
            if i == 0 { "" } else { "2.5" },
            if i == 0 { "".to_string() } else { "225".to_string() },
            "B",
            "0.4"
        ));
    }
    let run = calibrate_table(&csv, "controlled.csv", None, &Params::default(), &stub_scorer).unwrap();
    assert_eq!(run.fused.len(), 40);
    assert_eq!(run.estimated.wind_speed_ms, 2.5);
    assert_eq!(run.estimated.wind_direction_from_deg, 225.0);
    assert_eq!(run.estimated.stability, StabilityClass::B);
    assert!((run.estimated.source_latitude - lat(25)).abs() < 1e-9);
    assert_eq!(run.reference_rate_g_per_s, Some(0.4));
    assert!(run.species.is_none());
    // Each trial stamps its own class over the table's.
    assert_eq!(run.result().stability_used, StabilityClass::D);
}

#[test]
fn table_without_rows_is_malformed() {
    let err = calibrate_table("lat,lon,ch4\n", "empty.csv", None, &Params::default(), &stub_scorer)
        .unwrap_err();
    assert!(matches!(err, PlumeError::MalformedInput { .. }));
}
