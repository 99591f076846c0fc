//! TOML configuration parsing for sfcsim.
//!
//! Defines the complete configuration schema for a replicate: run kinds,
//! topology, the function and chain catalogue, demand, mobility, admission
//! control, the exact solver budget and the migration-state cost model.

use serde::{Deserialize, Serialize};
use sfcsim_placement::{FormulationOptions, ObjectiveMode, SolveBudget};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub run: RunSection,
    #[serde(default)]
    pub topology: TopologySection,
    #[serde(default)]
    pub functions: FunctionsSection,
    #[serde(default)]
    pub apps: AppsSection,
    #[serde(default)]
    pub requests: RequestsSection,
    #[serde(default)]
    pub mobility: MobilitySection,
    #[serde(default)]
    pub admission: AdmissionSection,
    #[serde(default)]
    pub exact: ExactSection,
    #[serde(default)]
    pub state_cost: StateCostSection,
    #[serde(default)]
    pub location_error: LocationErrorSection,
    #[serde(default)]
    pub experiment: ExperimentSection,
}

/// Strategy and control-loop variant a replicate is run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Regular,
    Full,
    Online,
    OnlineFull,
    LocationError,
    Heuristic,
}

impl RunKind {
    pub const ALL: [RunKind; 6] = [
        RunKind::Regular,
        RunKind::Full,
        RunKind::Online,
        RunKind::OnlineFull,
        RunKind::LocationError,
        RunKind::Heuristic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RunKind::Regular => "regular",
            RunKind::Full => "full",
            RunKind::Online => "online",
            RunKind::OnlineFull => "online_full",
            RunKind::LocationError => "location_error",
            RunKind::Heuristic => "heuristic",
        }
    }

    /// Directory artifacts of this kind are written to.
    pub fn dir_name(&self) -> String {
        format!("logs_{}", self.name())
    }

    /// Unpruned kinds that also skip gap adaptation.
    pub fn is_full(&self) -> bool {
        matches!(self, RunKind::Full | RunKind::OnlineFull)
    }

    pub fn is_online(&self) -> bool {
        matches!(self, RunKind::Online | RunKind::OnlineFull)
    }

    pub fn is_exact(&self) -> bool {
        !matches!(self, RunKind::Heuristic)
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// General run parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    /// Name of the results folder, `<name>_runlogs`.
    #[serde(default = "default_run_name")]
    pub name: String,
    /// Seed of replicate 0; replicate `i` uses `seed + i`.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of intervals.
    #[serde(default = "default_duration")]
    pub duration: u32,
    /// Number of independent replicates.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_kinds")]
    pub kinds: Vec<RunKind>,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    #[serde(default)]
    pub debug: bool,
}

fn default_run_name() -> String {
    "sfcsim".to_string()
}
fn default_seed() -> u64 {
    42
}
fn default_duration() -> u32 {
    5
}
fn default_iterations() -> u32 {
    1
}
fn default_kinds() -> Vec<RunKind> {
    vec![RunKind::Regular]
}
fn default_results_dir() -> String {
    "results".to_string()
}

/// Nodes and links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySection {
    /// CSV of `dc,x,y,capacity,procPower`. Synthetic grid when absent.
    pub nodes_path: Option<String>,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    #[serde(default = "default_grid_width")]
    pub grid_width: u32,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_processing_rate")]
    pub processing_rate: u32,
    /// Initial migration-state cost on every node.
    #[serde(default = "default_state_cost")]
    pub state_cost: u32,
    /// Coordinate distance within which two nodes are linked.
    #[serde(default = "default_allowed_range")]
    pub allowed_range: i64,
    #[serde(default = "default_link_delay")]
    pub link_delay: u32,
    #[serde(default = "default_link_bandwidth")]
    pub link_bandwidth: u32,
    /// Target utilization; 0 keeps `capacity`.
    #[serde(default)]
    pub utilization: f64,
}

fn default_nodes() -> u32 {
    9
}
fn default_grid_width() -> u32 {
    3
}
fn default_capacity() -> u32 {
    20
}
fn default_processing_rate() -> u32 {
    1
}
fn default_state_cost() -> u32 {
    1
}
fn default_allowed_range() -> i64 {
    1
}
fn default_link_delay() -> u32 {
    1
}
fn default_link_bandwidth() -> u32 {
    5
}

impl Default for TopologySection {
    fn default() -> Self {
        Self {
            nodes_path: None,
            nodes: default_nodes(),
            grid_width: default_grid_width(),
            capacity: default_capacity(),
            processing_rate: default_processing_rate(),
            state_cost: default_state_cost(),
            allowed_range: default_allowed_range(),
            link_delay: default_link_delay(),
            link_bandwidth: default_link_bandwidth(),
            utilization: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionsSection {
    /// CSV of `id,size`.
    pub path: Option<String>,
    #[serde(default = "default_function_count")]
    pub count: u32,
    #[serde(default = "default_mean_size")]
    pub mean_size: f64,
    /// Draw sizes from `Normal(mean_size, 1)` instead of using the mean.
    #[serde(default)]
    pub normal_sizes: bool,
}

fn default_function_count() -> u32 {
    5
}
fn default_mean_size() -> f64 {
    2.0
}

impl Default for FunctionsSection {
    fn default() -> Self {
        Self {
            path: None,
            count: default_function_count(),
            mean_size: default_mean_size(),
            normal_sizes: false,
        }
    }
}

/// How synthetic chain lengths are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthDistribution {
    Normal,
    Zipf,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppsSection {
    /// CSV of `appID,functions,constraints,size`.
    pub path: Option<String>,
    #[serde(default = "default_app_count")]
    pub count: u32,
    #[serde(default = "default_distribution")]
    pub distribution: LengthDistribution,
    #[serde(default = "default_mean_pairs")]
    pub mean_pairs: f64,
    #[serde(default = "default_pairs_std")]
    pub pairs_std: f64,
    #[serde(default = "default_mean_budget")]
    pub mean_budget: f64,
    #[serde(default = "default_budget_std")]
    pub budget_std: f64,
    /// Chain lengths (in functions) cycled over apps for `fixed`.
    #[serde(default)]
    pub fixed_sizes: Vec<u32>,
    #[serde(default)]
    pub randomize_fixed_budget: bool,
}

fn default_app_count() -> u32 {
    4
}
fn default_distribution() -> LengthDistribution {
    LengthDistribution::Normal
}
fn default_mean_pairs() -> f64 {
    2.0
}
fn default_pairs_std() -> f64 {
    1.0
}
fn default_mean_budget() -> f64 {
    10.0
}
fn default_budget_std() -> f64 {
    2.0
}

impl Default for AppsSection {
    fn default() -> Self {
        Self {
            path: None,
            count: default_app_count(),
            distribution: default_distribution(),
            mean_pairs: default_mean_pairs(),
            pairs_std: default_pairs_std(),
            mean_budget: default_mean_budget(),
            budget_std: default_budget_std(),
            fixed_sizes: Vec::new(),
            randomize_fixed_budget: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsSection {
    /// CSV of `time,reqID,dc,appID,revenue`. Synthetic random walk when absent.
    pub path: Option<String>,
    #[serde(default = "default_users")]
    pub users: u32,
    #[serde(default = "default_revenue_mean")]
    pub revenue_mean: f64,
    #[serde(default = "default_revenue_std")]
    pub revenue_std: f64,
    /// Probability mass a fanned-out request must keep to be admitted.
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,
    /// Number of destinations kept per prediction row; 0 keeps all.
    #[serde(default)]
    pub predictions_per_request: usize,
    #[serde(default)]
    pub limit_user_requests: bool,
    #[serde(default = "default_initial_realistic_capacity")]
    pub initial_realistic_capacity: u32,
}

fn default_users() -> u32 {
    20
}
fn default_revenue_mean() -> f64 {
    100.0
}
fn default_revenue_std() -> f64 {
    20.0
}
fn default_acceptance_threshold() -> f64 {
    0.5
}
fn default_initial_realistic_capacity() -> u32 {
    200
}

impl Default for RequestsSection {
    fn default() -> Self {
        Self {
            path: None,
            users: default_users(),
            revenue_mean: default_revenue_mean(),
            revenue_std: default_revenue_std(),
            acceptance_threshold: default_acceptance_threshold(),
            predictions_per_request: 0,
            limit_user_requests: false,
            initial_realistic_capacity: default_initial_realistic_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobilitySection {
    /// CSV of `time,src,dsts,probs`.
    pub matrices_path: Option<String>,
    /// CSV of `reqID,dsts,probs` random-walk vectors.
    pub per_user_path: Option<String>,
    /// Matrix used by the heuristic instead of the interval matrices.
    pub coverage_path: Option<String>,
    #[serde(default)]
    pub merge_intervals: bool,
    #[serde(default = "default_prediction_threshold")]
    pub prediction_threshold: f64,
    #[serde(default)]
    pub heuristic_threshold: f64,
    #[serde(default)]
    pub levy_walk: bool,
    #[serde(default)]
    pub levy_walk_exit_rate: f64,
    #[serde(default = "default_stay_probability")]
    pub stay_probability: f64,
}

fn default_prediction_threshold() -> f64 {
    0.05
}
fn default_stay_probability() -> f64 {
    0.5
}

impl Default for MobilitySection {
    fn default() -> Self {
        Self {
            matrices_path: None,
            per_user_path: None,
            coverage_path: None,
            merge_intervals: false,
            prediction_threshold: default_prediction_threshold(),
            heuristic_threshold: 0.0,
            levy_walk: false,
            levy_walk_exit_rate: 0.0,
            stay_probability: default_stay_probability(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSection {
    #[serde(default = "default_true")]
    pub low_revenue_pruning: bool,
    /// Demand-to-capacity multiplier; the controller starts at half of it.
    #[serde(default = "default_capacity_ratio")]
    pub capacity_ratio_threshold: f64,
    #[serde(default = "default_acceptable_gap")]
    pub acceptable_gap: f64,
}

fn default_true() -> bool {
    true
}
fn default_capacity_ratio() -> f64 {
    2.0
}
fn default_acceptable_gap() -> f64 {
    0.05
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            low_revenue_pruning: true,
            capacity_ratio_threshold: default_capacity_ratio(),
            acceptable_gap: default_acceptable_gap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactSection {
    /// Solver backend opened for every model.
    #[serde(default = "default_solver")]
    pub solver: String,
    #[serde(default)]
    pub objective: ObjectiveMode,
    #[serde(default)]
    pub place_at_user_location: bool,
    #[serde(default)]
    pub non_split: bool,
    pub time_limit_ms: Option<u64>,
    #[serde(default = "default_node_limit")]
    pub node_limit: u64,
    #[serde(default = "default_full_node_limit")]
    pub full_node_limit: u64,
    #[serde(default = "default_true")]
    pub check_broken_chains: bool,
}

fn default_solver() -> String {
    "branch_and_bound".to_string()
}
fn default_node_limit() -> u64 {
    20_000
}
fn default_full_node_limit() -> u64 {
    100_000
}

impl Default for ExactSection {
    fn default() -> Self {
        Self {
            solver: default_solver(),
            objective: ObjectiveMode::Pairwise,
            place_at_user_location: false,
            non_split: false,
            time_limit_ms: None,
            node_limit: default_node_limit(),
            full_node_limit: default_full_node_limit(),
            check_broken_chains: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCostSection {
    #[serde(default)]
    pub dynamic: bool,
    /// The cost moves by `state_cost / step_percent` per adjustment.
    #[serde(default = "default_step_percent")]
    pub step_percent: u32,
}

fn default_step_percent() -> u32 {
    10
}

impl Default for StateCostSection {
    fn default() -> Self {
        Self {
            dynamic: false,
            step_percent: default_step_percent(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationErrorSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSection {
    /// Sweep values for the selected experiment.
    #[serde(default = "default_values")]
    pub values: Vec<f64>,
}

fn default_values() -> Vec<f64> {
    vec![0.0]
}

impl Default for ExperimentSection {
    fn default() -> Self {
        Self {
            values: default_values(),
        }
    }
}

impl SimConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.duration == 0 {
            return Err(ConfigError::Validation("duration must be > 0".to_string()));
        }
        if self.run.iterations == 0 {
            return Err(ConfigError::Validation(
                "iterations must be > 0".to_string(),
            ));
        }
        if self.run.kinds.is_empty() {
            return Err(ConfigError::Validation(
                "kinds must name at least one run kind".to_string(),
            ));
        }
        if self.topology.nodes_path.is_none() && self.topology.nodes == 0 {
            return Err(ConfigError::Validation("nodes must be > 0".to_string()));
        }
        if self.topology.grid_width == 0 {
            return Err(ConfigError::Validation(
                "grid_width must be > 0".to_string(),
            ));
        }
        if self.topology.utilization < 0.0 {
            return Err(ConfigError::Validation(
                "utilization must be >= 0".to_string(),
            ));
        }
        let probabilities = [
            ("acceptance_threshold", self.requests.acceptance_threshold),
            ("prediction_threshold", self.mobility.prediction_threshold),
            ("heuristic_threshold", self.mobility.heuristic_threshold),
            ("levy_walk_exit_rate", self.mobility.levy_walk_exit_rate),
            ("stay_probability", self.mobility.stay_probability),
            ("location_error.rate", self.location_error.rate),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Validation(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.admission.capacity_ratio_threshold < 0.0 || self.admission.acceptable_gap < 0.0 {
            return Err(ConfigError::Validation(
                "admission thresholds must be >= 0".to_string(),
            ));
        }
        if self.apps.distribution == LengthDistribution::Fixed
            && self.apps.path.is_none()
            && self.apps.fixed_sizes.is_empty()
        {
            return Err(ConfigError::Validation(
                "fixed app distribution requires fixed_sizes".to_string(),
            ));
        }
        if self.apps.fixed_sizes.iter().any(|s| *s < 2) {
            return Err(ConfigError::Validation(
                "fixed_sizes entries must be >= 2".to_string(),
            ));
        }
        if self.state_cost.step_percent == 0 {
            return Err(ConfigError::Validation(
                "step_percent must be > 0".to_string(),
            ));
        }
        if !sfcsim_placement::available_solvers().contains(&self.exact.solver.as_str()) {
            return Err(ConfigError::Validation(format!(
                "unknown solver '{}'. Available: {:?}",
                self.exact.solver,
                sfcsim_placement::available_solvers()
            )));
        }
        if self.exact.node_limit == 0 || self.exact.full_node_limit == 0 {
            return Err(ConfigError::Validation(
                "solver node limits must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Options for the exact formulation under this configuration.
    pub fn formulation_options(&self) -> FormulationOptions {
        FormulationOptions {
            objective: self.exact.objective,
            place_at_user_location: self.exact.place_at_user_location,
            non_split: self.exact.non_split,
            acceptance_threshold: self.requests.acceptance_threshold,
        }
    }

    /// Solver budget of an estimated solve for `kind`.
    pub fn solve_budget(&self, kind: RunKind) -> SolveBudget {
        let node_limit = if kind.is_full() {
            self.exact.full_node_limit
        } else {
            self.exact.node_limit
        };
        SolveBudget {
            node_limit,
            time_limit: self.exact.time_limit_ms.map(Duration::from_millis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
[run]
name = "test-sim"
seed = 123
duration = 4
kinds = ["regular", "heuristic", "online_full"]

[topology]
nodes = 4
grid_width = 2
capacity = 8

[apps]
distribution = "fixed"
fixed_sizes = [2, 3]

[exact]
objective = "end_to_end"
node_limit = 500
"#;

    #[test]
    fn test_parse_config() {
        let config = SimConfig::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.run.name, "test-sim");
        assert_eq!(config.run.seed, 123);
        assert_eq!(config.topology.nodes, 4);
        assert_eq!(
            config.run.kinds,
            vec![RunKind::Regular, RunKind::Heuristic, RunKind::OnlineFull]
        );
        assert_eq!(config.exact.objective, ObjectiveMode::EndToEnd);
    }

    #[test]
    fn test_defaults() {
        let config = SimConfig::from_str("[run]\n").unwrap();
        assert_eq!(config.run.seed, 42);
        assert_eq!(config.run.kinds, vec![RunKind::Regular]);
        assert_eq!(config.topology.nodes, 9);
        assert!(config.admission.low_revenue_pruning);
        assert!(config.exact.check_broken_chains);
        assert_eq!(config.experiment.values, vec![0.0]);
    }

    #[test]
    fn test_validation_zero_duration() {
        assert!(SimConfig::from_str("[run]\nduration = 0\n").is_err());
    }

    #[test]
    fn test_validation_unknown_kind() {
        let err = SimConfig::from_str("[run]\nkinds = [\"batch\"]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_fixed_without_sizes() {
        let toml = r#"
[run]

[apps]
distribution = "fixed"
"#;
        assert!(SimConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_online_kinds_accept_location_error() {
        let toml = r#"
[run]
kinds = ["online", "online_full", "location_error"]

[location_error]
enabled = true
rate = 0.2
"#;
        let config = SimConfig::from_str(toml).unwrap();
        assert!(config.location_error.enabled);
        assert!(config.run.kinds.iter().any(RunKind::is_online));
    }

    #[test]
    fn test_validation_negative_threshold() {
        let toml = r#"
[run]

[mobility]
prediction_threshold = -0.1
"#;
        assert!(SimConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_full_kinds_use_full_budget() {
        let config = SimConfig::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.solve_budget(RunKind::Regular).node_limit, 500);
        assert_eq!(config.solve_budget(RunKind::Full).node_limit, 100_000);
        assert_eq!(config.solve_budget(RunKind::OnlineFull).node_limit, 100_000);
    }
}
