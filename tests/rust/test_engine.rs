/// Integration tests for the interval engine and experiment runner.
use sfcsim_core::artifacts::{DATACENTERS, PLACED_APPS, RUNTIME, SUMMARY_JSON, SUMMARY_LOG};
use sfcsim_core::config::{RunKind, SimConfig};
use sfcsim_core::metrics::RunSummary;
use sfcsim_core::runner::{
    replicate_dir, results_root, run_experiment, run_experiment_with, Experiment,
};
use sfcsim_core::{load_inputs, run_kind, run_replicate, SimError};
use std::path::Path;

fn small_config(kinds: &str, extra: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[run]
name = "integration"
seed = 42
duration = 3
kinds = [{kinds}]

[topology]
nodes = 4
grid_width = 2
capacity = 12
link_bandwidth = 6

[functions]
count = 4

[apps]
count = 2

[requests]
users = 6

[exact]
node_limit = 2000
full_node_limit = 4000
{extra}
"#
    ))
    .unwrap()
}

fn read_summary(dir: &Path) -> RunSummary {
    let json = std::fs::read_to_string(dir.join(SUMMARY_JSON)).unwrap();
    serde_json::from_str(&json).unwrap()
}

fn assert_sane(summary: &RunSummary) {
    assert!(
        summary.served <= summary.demand,
        "{} served {} of {}",
        summary.kind,
        summary.served,
        summary.demand
    );
    assert!((0.0..=1.0).contains(&summary.acceptance_rate));
    assert!(summary.gap.min >= 0.0);
}

#[test]
fn test_regular_run_writes_artifacts() {
    let config = small_config("\"regular\"", "");
    let tmp = tempfile::tempdir().unwrap();
    let summaries = run_replicate(&config, 42, 0.0, tmp.path()).unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].kind, "regular");
    assert_sane(&summaries[0]);

    let logs = tmp.path().join("logs_regular");
    for file in [DATACENTERS, RUNTIME, SUMMARY_JSON, SUMMARY_LOG] {
        assert!(logs.join(file).exists(), "missing {}", file);
    }
    let written = read_summary(&logs);
    assert_eq!(written.served, summaries[0].served);
    assert_eq!(written.demand, summaries[0].demand);
}

#[test]
fn test_predictive_run_skips_first_interval_demand() {
    let config = small_config("\"regular\"", "");
    let inputs = load_inputs(&config, 42).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let summary = run_kind(&config, &inputs, RunKind::Regular, tmp.path(), 42, 0.0).unwrap();
    let realized: usize = (1..3).map(|t| inputs.requests(t).len()).sum();
    assert_eq!(summary.demand, realized as u64);
}

#[test]
fn test_online_run_covers_the_same_intervals_as_predictive() {
    let config = small_config("\"online\"", "");
    let inputs = load_inputs(&config, 42).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let summary = run_kind(&config, &inputs, RunKind::Online, tmp.path(), 42, 0.0).unwrap();
    let realized: usize = (1..3).map(|t| inputs.requests(t).len()).sum();
    assert_eq!(summary.demand, realized as u64);
    assert_eq!(summary.reconcile.served, 0);
    assert_sane(&summary);
}

#[test]
fn test_every_kind_completes() {
    let config = small_config(
        "\"regular\", \"full\", \"online\", \"online_full\", \"heuristic\"",
        "",
    );
    let tmp = tempfile::tempdir().unwrap();
    let summaries = run_replicate(&config, 7, 0.0, tmp.path()).unwrap();
    let kinds: Vec<&str> = summaries.iter().map(|s| s.kind.as_str()).collect();
    assert_eq!(kinds, vec!["regular", "full", "online", "online_full", "heuristic"]);
    for summary in &summaries {
        assert_sane(summary);
        assert!(tmp.path().join(format!("logs_{}", summary.kind)).join(SUMMARY_JSON).exists());
    }
}

#[test]
fn test_heuristic_run_records_placements() {
    let config = small_config("\"heuristic\"", "");
    let tmp = tempfile::tempdir().unwrap();
    let summaries = run_replicate(&config, 42, 0.0, tmp.path()).unwrap();
    let summary = &summaries[0];
    assert_sane(summary);
    assert_eq!(summary.solves, 3);
    if summary.served > 0 {
        assert!(tmp.path().join("logs_heuristic").join(PLACED_APPS).exists());
    }
}

#[test]
fn test_location_error_run_completes() {
    let config = small_config(
        "\"regular\", \"location_error\"",
        "\n[location_error]\nenabled = true\nrate = 0.5\n",
    );
    let tmp = tempfile::tempdir().unwrap();
    let summaries = run_replicate(&config, 42, 0.5, tmp.path()).unwrap();
    assert_eq!(summaries.len(), 2);
    for summary in &summaries {
        assert_sane(summary);
        assert_eq!(summary.value, 0.5);
    }
}

#[test]
fn test_same_seed_same_outcome() {
    let config = small_config("\"regular\", \"heuristic\"", "");
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let first = run_replicate(&config, 11, 0.0, a.path()).unwrap();
    let second = run_replicate(&config, 11, 0.0, b.path()).unwrap();
    for (x, y) in first.iter().zip(&second) {
        assert_eq!(x.kind, y.kind);
        assert_eq!(x.demand, y.demand);
        assert_eq!(x.served, y.served);
        assert_eq!(x.revenue, y.revenue);
        assert_eq!(x.cost_paid, y.cost_paid);
        assert_eq!(x.reconcile, y.reconcile);
    }
}

#[test]
fn test_rerun_appends_to_existing_logs() {
    let config = small_config("\"regular\"", "");
    let tmp = tempfile::tempdir().unwrap();
    run_replicate(&config, 42, 0.0, tmp.path()).unwrap();
    let log = tmp.path().join("logs_regular").join(SUMMARY_LOG);
    let once = std::fs::read_to_string(&log).unwrap().len();
    run_replicate(&config, 42, 0.0, tmp.path()).unwrap();
    let twice = std::fs::read_to_string(&log).unwrap().len();
    assert!(twice > once);
}

#[test]
fn test_experiment_sweep_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = small_config("\"regular\"", "\n[experiment]\nvalues = [0.0, 3.0]\n");
    config.run.iterations = 2;
    config.run.results_dir = tmp.path().display().to_string();

    let report = run_experiment(&config, Experiment::SetupCost).unwrap();
    assert!(report.is_complete());
    let summaries = report.summaries;
    assert_eq!(summaries.len(), 4);
    let order: Vec<(u64, f64)> = summaries.iter().map(|s| (s.seed, s.value)).collect();
    assert_eq!(order, vec![(42, 0.0), (42, 3.0), (43, 0.0), (43, 3.0)]);

    let root = results_root(&config, Experiment::SetupCost);
    assert!(root.ends_with("setup_cost_runlogs"));
    for (seed, value) in order {
        let dir = replicate_dir(&root, value, seed).join("logs_regular");
        assert!(dir.join(SUMMARY_JSON).exists(), "missing {}", dir.display());
    }
}

#[test]
fn test_experiment_rejects_bad_sweep_value_before_running() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = small_config("\"regular\"", "\n[experiment]\nvalues = [0.2, 1.5]\n");
    config.run.results_dir = tmp.path().display().to_string();

    assert!(run_experiment(&config, Experiment::MispredictRate).is_err());
    let root = results_root(&config, Experiment::MispredictRate);
    assert!(!replicate_dir(&root, 0.2, 42).exists());
}

#[test]
fn test_online_kinds_run_with_location_error_enabled() {
    let config = small_config(
        "\"online\", \"online_full\", \"location_error\"",
        "\n[location_error]\nenabled = true\nrate = 0.3\n",
    );
    let tmp = tempfile::tempdir().unwrap();
    let summaries = run_replicate(&config, 42, 0.3, tmp.path()).unwrap();
    let kinds: Vec<&str> = summaries.iter().map(|s| s.kind.as_str()).collect();
    assert_eq!(kinds, vec!["online", "online_full", "location_error"]);
    for summary in &summaries {
        assert_sane(summary);
    }
}

#[test]
fn test_mispredict_sweep_includes_online_kinds() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = small_config("\"regular\", \"online\"", "\n[experiment]\nvalues = [0.2]\n");
    config.run.results_dir = tmp.path().display().to_string();

    let report = run_experiment(&config, Experiment::MispredictRate).unwrap();
    assert!(report.is_complete());
    let kinds: Vec<&str> = report.summaries.iter().map(|s| s.kind.as_str()).collect();
    assert_eq!(kinds, vec!["regular", "online"]);
}

#[test]
fn test_experiment_keeps_going_past_a_failed_replicate() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = small_config("\"regular\"", "\n[experiment]\nvalues = [0.0, 3.0]\n");
    config.run.iterations = 2;
    config.run.results_dir = tmp.path().display().to_string();

    let report = run_experiment_with(&config, Experiment::SetupCost, |cfg, seed, value, dir| {
        if seed == 42 && value == 0.0 {
            return Err(SimError::Worker("inputs unavailable".to_string()));
        }
        run_replicate(cfg, seed, value, dir)
    })
    .unwrap();

    let order: Vec<(u64, f64)> = report.summaries.iter().map(|s| (s.seed, s.value)).collect();
    assert_eq!(order, vec![(42, 3.0), (43, 0.0), (43, 3.0)]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!((report.failures[0].seed, report.failures[0].value), (42, 0.0));

    let root = results_root(&config, Experiment::SetupCost);
    assert!(!replicate_dir(&root, 0.0, 42).join("logs_regular").exists());
    assert!(replicate_dir(&root, 3.0, 42).join("logs_regular").join(SUMMARY_JSON).exists());
}
