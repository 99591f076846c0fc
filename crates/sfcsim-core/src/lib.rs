//! sfcsim — interval-driven simulator for mobility-aware service function
//! chain placement.
//!
//! This crate drives the placement strategies of `sfcsim-placement` over a
//! sequence of intervals: it loads or synthesizes the topology and demand,
//! fans predicted demand out over likely user locations, prunes it, places
//! it, and reconciles the reservations against what users actually did.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────┐     ┌──────────────┐
//! │  Loader  │────▶│  Interval │────▶│   Metrics    │
//! │Generator │     │  Engine   │     │  Artifacts   │
//! └──────────┘     └─────┬─────┘     └──────────────┘
//!                        │
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │ Weighting│  │ Admission│  │ Reconcile│
//!    │ (fan-out)│  │ (pruning)│  │ (adjust) │
//!    └──────────┘  └──────────┘  └──────────┘
//!                        │
//!                ┌───────┴───────┐
//!                │   Placement   │
//!                │ exact / greedy│
//!                └───────────────┘
//! ```

pub mod admission;
pub mod artifacts;
pub mod config;
pub mod engine;
pub mod generator;
pub mod loader;
pub mod metrics;
pub mod mobility;
pub mod reconcile;
pub mod runner;
pub mod weighting;

pub use admission::{prune_low_revenue, update_gap, AdaptiveController, PruneOutcome, PruneParams};
pub use artifacts::ArtifactSink;
pub use config::{ConfigError, RunKind, SimConfig};
pub use engine::IntervalEngine;
pub use loader::{load_inputs, Inputs, LoadError};
pub use metrics::{MetricsCollector, RunSummary};
pub use mobility::{MobilityModel, ProbMatrix};
pub use reconcile::{reconcile, PredictionState, ReconcileCounts, Reconciliation};
pub use runner::{run_experiment, Experiment};
pub use weighting::{weighted_fan_out, FanOutOptions, Prediction};

use sfcsim_placement::{InputError, InvariantViolation, PlacementError};
use std::path::Path;
use thiserror::Error;

/// Fatal outcome of a replicate.
#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("Malformed input: {0}")]
    Input(#[from] InputError),
    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("Failed to write CSV artifact: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to write JSON artifact: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown solver: {0}")]
    UnknownSolver(String),
    #[error("Worker failed: {0}")]
    Worker(String),
}

impl From<PlacementError> for SimError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::Invariant(e) => SimError::Invariant(e),
            PlacementError::Input(e) => SimError::Input(e),
        }
    }
}

/// Run a single run kind over prepared inputs, writing its artifacts to
/// `dir`.
pub fn run_kind(
    config: &SimConfig,
    inputs: &Inputs,
    kind: RunKind,
    dir: &Path,
    seed: u64,
    value: f64,
) -> Result<RunSummary, SimError> {
    let sink = ArtifactSink::create(dir)?;
    IntervalEngine::new(config, inputs, kind, sink, seed)
        .with_value(value)
        .run()
}

/// Run every configured run kind of one replicate. Each kind gets its own
/// copy of the inputs' topology and writes under `dir/logs_<kind>/`.
pub fn run_replicate(
    config: &SimConfig,
    seed: u64,
    value: f64,
    dir: &Path,
) -> Result<Vec<RunSummary>, SimError> {
    let inputs = load_inputs(config, seed)?;
    config
        .run
        .kinds
        .iter()
        .map(|kind| run_kind(config, &inputs, *kind, &dir.join(kind.dir_name()), seed, value))
        .collect()
}
