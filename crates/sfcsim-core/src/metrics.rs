//! Metrics collection and aggregation for one run kind of a replicate.
//!
//! Tracks per-solve records (gap, branch-and-bound nodes, wall time) and
//! per-interval service of realized demand.

use crate::reconcile::ReconcileCounts;
use serde::{Deserialize, Serialize};

/// One solve or replay of an interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalRecord {
    pub time: u32,
    pub phase: String,
    /// Fan-out instances handed to the strategy.
    pub instances: usize,
    /// Logical requests placed by this solve.
    pub placed: usize,
    pub gap: f64,
    pub nodes: u64,
    pub elapsed_ms: f64,
    pub capacity_ratio: f64,
}

/// Percentile values for a distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    /// Compute percentiles from a slice of values.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                p50: 0.0,
                p90: 0.0,
                p99: 0.0,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;

        Self {
            p50: percentile_sorted(&sorted, 50.0),
            p90: percentile_sorted(&sorted, 90.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean,
        }
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Aggregated metrics of one run kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub kind: String,
    pub seed: u64,
    /// Sweep value the replicate ran under.
    pub value: f64,
    pub solves: usize,
    /// Realized requests over all served intervals.
    pub demand: u64,
    pub served: u64,
    pub acceptance_rate: f64,
    /// Revenue of the served realized requests.
    pub revenue: u64,
    /// Migration cost paid by every placement.
    pub cost_paid: u64,
    pub gap: Percentiles,
    pub solve_ms: Percentiles,
    pub reconcile: ReconcileCounts,
}

/// Collector that accumulates interval records during a run.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    records: Vec<IntervalRecord>,
    demand: u64,
    served: u64,
    revenue: u64,
    cost_paid: u64,
    reconcile: ReconcileCounts,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a solve or replay.
    pub fn record(&mut self, record: IntervalRecord) {
        self.records.push(record);
    }

    /// Record how much realized demand an interval served.
    pub fn record_service(&mut self, demand: usize, served: usize, revenue: u64) {
        self.demand += demand as u64;
        self.served += served as u64;
        self.revenue += revenue;
    }

    pub fn record_cost(&mut self, cost: u64) {
        self.cost_paid += cost;
    }

    pub fn record_reconcile(&mut self, counts: ReconcileCounts) {
        self.reconcile += counts;
    }

    pub fn records(&self) -> &[IntervalRecord] {
        &self.records
    }

    /// Aggregate all records into a summary.
    pub fn aggregate(&self, kind: &str, seed: u64, value: f64) -> RunSummary {
        let gaps: Vec<f64> = self.records.iter().map(|r| r.gap).collect();
        let times: Vec<f64> = self.records.iter().map(|r| r.elapsed_ms).collect();
        RunSummary {
            kind: kind.to_string(),
            seed,
            value,
            solves: self.records.len(),
            demand: self.demand,
            served: self.served,
            acceptance_rate: if self.demand > 0 {
                self.served as f64 / self.demand as f64
            } else {
                0.0
            },
            revenue: self.revenue,
            cost_paid: self.cost_paid,
            gap: Percentiles::from_values(&gaps),
            solve_ms: Percentiles::from_values(&times),
            reconcile: self.reconcile,
        }
    }
}

/// Format a summary as a pretty-printed table string.
pub fn format_table(summary: &RunSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:=<70}\n",
        format!("  {} Results  ", summary.kind)
    ));
    out.push_str(&format!(
        "  Seed: {} | Value: {} | Solves: {}\n",
        summary.seed, summary.value, summary.solves
    ));
    out.push_str(&format!("{:-<70}\n", "  Demand  "));
    out.push_str(&format!(
        "  Served: {}/{} ({:.1}%)  Revenue: {}  Cost paid: {}\n",
        summary.served,
        summary.demand,
        summary.acceptance_rate * 100.0,
        summary.revenue,
        summary.cost_paid,
    ));
    out.push_str(&format!("{:-<70}\n", "  Solver  "));
    out.push_str(&format!(
        "  Gap        P50={:>8.3}  P90={:>8.3}  Max={:>8.3}\n",
        summary.gap.p50, summary.gap.p90, summary.gap.max
    ));
    out.push_str(&format!(
        "  Time (ms)  P50={:>8.1}  P90={:>8.1}  Max={:>8.1}\n",
        summary.solve_ms.p50, summary.solve_ms.p90, summary.solve_ms.max
    ));
    let c = &summary.reconcile;
    if c != &ReconcileCounts::default() {
        out.push_str(&format!("{:-<70}\n", "  Reconciliation  "));
        out.push_str(&format!(
            "  Served: {}  Repurposed: {}  Redirected: {}  Missed: {}  Expired: {}  New: {}\n",
            c.served, c.repurposed, c.redirected, c.missed, c.expired, c.new
        ));
    }
    out.push_str(&format!("{:=<70}\n", ""));
    out
}

/// Format a comparison table of per-kind summaries, averaged over replicates.
pub fn format_comparison_table(results: &[RunSummary]) -> String {
    if results.is_empty() {
        return String::from("No results to compare.\n");
    }

    let mut groups: Vec<(&str, f64, Vec<&RunSummary>)> = Vec::new();
    for r in results {
        let at = groups
            .iter()
            .position(|g| g.0 == r.kind.as_str() && g.1 == r.value);
        match at {
            Some(i) => groups[i].2.push(r),
            None => groups.push((r.kind.as_str(), r.value, vec![r])),
        }
    }

    let mut out = String::new();
    out.push_str(&format!("\n{:=<90}\n", "  Run Kind Comparison  "));
    out.push_str(&format!(
        "{:<16} {:>8} {:>6} {:>9} {:>10} {:>10} {:>9} {:>9}\n",
        "Kind", "Value", "Runs", "Accept%", "Revenue", "Cost", "Gap p50", "Time p50"
    ));
    out.push_str(&format!("{:-<90}\n", ""));

    for (kind, value, members) in &groups {
        let n = members.len() as f64;
        let mean = |f: &dyn Fn(&RunSummary) -> f64| members.iter().map(|m| f(m)).sum::<f64>() / n;
        out.push_str(&format!(
            "{:<16} {:>8} {:>6} {:>8.1}% {:>10.0} {:>10.0} {:>9.3} {:>9.1}\n",
            kind,
            value,
            members.len(),
            mean(&|m| m.acceptance_rate) * 100.0,
            mean(&|m| m.revenue as f64),
            mean(&|m| m.cost_paid as f64),
            mean(&|m| m.gap.p50),
            mean(&|m| m.solve_ms.p50),
        ));
    }
    out.push_str(&format!("{:=<90}\n", ""));
    out
}
