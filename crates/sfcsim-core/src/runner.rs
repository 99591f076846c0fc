//! Experiment sweeps over independent seeded replicates.
//!
//! Every replicate (one seed) sweeps all experiment values sequentially with
//! its own inputs and topology clones. Replicates share nothing and are fed
//! to a bounded pool of worker threads through a channel.

use crate::config::{ConfigError, SimConfig};
use crate::metrics::RunSummary;
use crate::{run_replicate, SimError};
use crossbeam_channel::unbounded;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Worker threads kept free for the rest of the machine.
const RESERVED_CORES: usize = 4;

/// Parameter an experiment sweeps over `experiment.values`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Experiment {
    /// Probability that a prediction misses the user's next location.
    MispredictRate,
    /// Migration-state cost of every node.
    SetupCost,
    /// Target utilization the node capacities are derived from.
    Utilization,
}

impl Experiment {
    /// Experiment selected by the CLI's integer argument.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Experiment::MispredictRate),
            2 => Some(Experiment::SetupCost),
            3 => Some(Experiment::Utilization),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Experiment::MispredictRate => "mispredict_rate",
            Experiment::SetupCost => "setup_cost",
            Experiment::Utilization => "utilization",
        }
    }

    /// The configuration a replicate runs under for sweep `value`.
    pub fn apply(&self, config: &SimConfig, value: f64) -> Result<SimConfig, ConfigError> {
        let mut config = config.clone();
        match self {
            Experiment::MispredictRate => {
                config.location_error.enabled = true;
                config.location_error.rate = value;
            }
            Experiment::SetupCost => {
                if value < 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "setup cost must be >= 0, got {}",
                        value
                    )));
                }
                config.topology.state_cost = value as u32;
                config.apps.randomize_fixed_budget = true;
            }
            Experiment::Utilization => config.topology.utilization = value,
        }
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Display for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Root folder all replicates of `experiment` write under.
pub fn results_root(config: &SimConfig, experiment: Experiment) -> PathBuf {
    Path::new(&config.run.results_dir).join(format!("{}_runlogs", experiment.name()))
}

/// Directory of one `(value, seed)` replicate below `root`.
pub fn replicate_dir(root: &Path, value: f64, seed: u64) -> PathBuf {
    root.join(format!("{}", value)).join(seed.to_string())
}

/// Number of workers for `jobs` replicates.
pub fn worker_count(jobs: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    available.saturating_sub(RESERVED_CORES).max(1).min(jobs.max(1))
}

/// A `(value, seed)` replicate that stopped with an error.
#[derive(Debug)]
pub struct ReplicateFailure {
    pub value: f64,
    pub seed: u64,
    pub error: SimError,
}

impl fmt::Display for ReplicateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value {} seed {}: {}", self.value, self.seed, self.error)
    }
}

/// Everything an experiment produced.
#[derive(Debug, Default)]
pub struct ExperimentReport {
    /// Summaries of the replicates that finished, ordered by seed, then
    /// value, then run kind.
    pub summaries: Vec<RunSummary>,
    /// Replicates that failed, in the same order.
    pub failures: Vec<ReplicateFailure>,
}

impl ExperimentReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run `config.run.iterations` replicates of `experiment`, recreating the
/// results folder first.
pub fn run_experiment(config: &SimConfig, experiment: Experiment) -> Result<ExperimentReport, SimError> {
    run_experiment_with(config, experiment, run_replicate)
}

/// [`run_experiment`] with the per-replicate work supplied by the caller.
/// A failing replicate is recorded and the remaining values and seeds still
/// run.
pub fn run_experiment_with<F>(
    config: &SimConfig,
    experiment: Experiment,
    replicate: F,
) -> Result<ExperimentReport, SimError>
where
    F: Fn(&SimConfig, u64, f64, &Path) -> Result<Vec<RunSummary>, SimError> + Sync,
{
    // Reject bad sweep values before any worker starts.
    let configs = config
        .experiment
        .values
        .iter()
        .map(|v| Ok((*v, experiment.apply(config, *v)?)))
        .collect::<Result<Vec<(f64, SimConfig)>, ConfigError>>()?;

    let root = results_root(config, experiment);
    if root.exists() {
        fs::remove_dir_all(&root)?;
    }
    fs::create_dir_all(&root)?;

    let seeds: Vec<u64> = (0..config.run.iterations as u64)
        .map(|i| config.run.seed + i)
        .collect();
    let workers = worker_count(seeds.len());
    info!(
        experiment = %experiment,
        replicates = seeds.len(),
        values = configs.len(),
        workers,
        root = %root.display(),
        "experiment started"
    );

    let (job_tx, job_rx) = unbounded::<u64>();
    let (result_tx, result_rx) = unbounded::<(u64, Vec<SweepResult>)>();
    for seed in &seeds {
        job_tx
            .send(*seed)
            .map_err(|e| SimError::Worker(e.to_string()))?;
    }
    drop(job_tx);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let configs = &configs;
            let root = &root;
            let replicate = &replicate;
            scope.spawn(move || {
                for seed in job_rx.iter() {
                    info!(worker, seed, "replicate started");
                    let results = run_sweep(configs, seed, root, replicate);
                    for (value, result) in &results {
                        if let Err(e) = result {
                            warn!(worker, seed, value, error = %e, "replicate failed");
                        }
                    }
                    if result_tx.send((seed, results)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let by_seed: BTreeMap<u64, Vec<SweepResult>> = result_rx.iter().collect();
    if by_seed.len() != seeds.len() {
        return Err(SimError::Worker(format!(
            "{} of {} replicates reported back",
            by_seed.len(),
            seeds.len()
        )));
    }
    let mut report = ExperimentReport::default();
    for (seed, results) in by_seed {
        for (value, result) in results {
            match result {
                Ok(summaries) => report.summaries.extend(summaries),
                Err(error) => report.failures.push(ReplicateFailure { value, seed, error }),
            }
        }
    }
    info!(
        runs = report.summaries.len(),
        failed = report.failures.len(),
        "experiment finished"
    );
    Ok(report)
}

type SweepResult = (f64, Result<Vec<RunSummary>, SimError>);

fn run_sweep<F>(
    configs: &[(f64, SimConfig)],
    seed: u64,
    root: &Path,
    replicate: &F,
) -> Vec<SweepResult>
where
    F: Fn(&SimConfig, u64, f64, &Path) -> Result<Vec<RunSummary>, SimError>,
{
    configs
        .iter()
        .map(|(value, config)| {
            let dir = replicate_dir(root, *value, seed);
            (*value, replicate(config, seed, *value, &dir))
        })
        .collect()
}
