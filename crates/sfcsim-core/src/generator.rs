//! Synthetic inputs: grid topologies, function and chain catalogues, and
//! random-walking users whose movements also yield empirical predictions.

use crate::config::{AppsSection, FunctionsSection, LengthDistribution, SimConfig, TopologySection};
use crate::loader::LoadError;
use crate::mobility::ProbMatrix;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal, Zipf};
use sfcsim_placement::{AppId, Catalog, Function, NodeSpec, PairRow, Request, RequestId, Topology};
use std::collections::BTreeMap;

const FUNCTION_ZIPF_EXPONENT: f64 = 1.07;
const MAX_RESAMPLES: usize = 1000;

fn normal(mean: f64, std: f64) -> Result<Normal<f64>, LoadError> {
    Normal::new(mean, std).map_err(|e| LoadError::Distribution(format!("normal({mean}, {std}): {e}")))
}

fn zipf(n: u64, exponent: f64) -> Result<Zipf<f64>, LoadError> {
    Zipf::new(n, exponent)
        .map_err(|e| LoadError::Distribution(format!("zipf({n}, {exponent}): {e:?}")))
}

/// Draw from `dist` until the value is positive, rounded to an integer.
fn positive<R: Rng, D: Distribution<f64>>(dist: &D, rng: &mut R) -> u32 {
    for _ in 0..MAX_RESAMPLES {
        let value = dist.sample(rng).round();
        if value > 0.0 {
            return value as u32;
        }
    }
    1
}

/// `nodes` nodes laid out row by row on a grid `grid_width` wide.
pub fn grid_nodes(cfg: &TopologySection) -> Vec<NodeSpec> {
    let width = cfg.grid_width.max(1) as usize;
    (0..cfg.nodes as usize)
        .map(|id| NodeSpec {
            id,
            x: (id % width) as i64,
            y: (id / width) as i64,
            capacity: cfg.capacity,
            processing_rate: cfg.processing_rate,
            state_cost: cfg.state_cost,
        })
        .collect()
}

/// Functions `1..=count`.
pub fn functions<R: Rng>(cfg: &FunctionsSection, rng: &mut R) -> Result<Vec<Function>, LoadError> {
    let dist = normal(cfg.mean_size, 1.0)?;
    let mean = cfg.mean_size.round().max(1.0) as u32;
    Ok((1..=cfg.count)
        .map(|id| {
            let size = if cfg.normal_sizes { positive(&dist, rng) } else { mean };
            Function { id, size }
        })
        .collect())
}

/// Chains over `functions`, as pair rows of apps `1..=count`.
pub fn apps<R: Rng>(
    cfg: &AppsSection,
    functions: &[Function],
    rng: &mut R,
) -> Result<Vec<PairRow>, LoadError> {
    if functions.len() < 2 {
        return Err(LoadError::Distribution(
            "chains need at least two functions".to_string(),
        ));
    }
    let mut ids: Vec<u32> = functions.iter().map(|f| f.id).collect();
    ids.shuffle(rng);
    let pick = zipf(ids.len() as u64, FUNCTION_ZIPF_EXPONENT)?;
    let pairs_normal = normal(cfg.mean_pairs, cfg.pairs_std.max(0.0))?;
    let pairs_zipf = zipf(cfg.mean_pairs.round().max(1.0) as u64, 1.0)?;
    let budget_dist = normal(cfg.mean_budget, cfg.budget_std.max(0.0))?;
    let max_pairs = ids.len() - 1;

    let mut rows = Vec::new();
    for (i, app) in (1..=cfg.count).enumerate() {
        let pairs = match cfg.distribution {
            LengthDistribution::Normal => positive(&pairs_normal, rng) as usize,
            LengthDistribution::Zipf => pairs_zipf.sample(rng) as usize + 1,
            LengthDistribution::Fixed => {
                let sizes = &cfg.fixed_sizes;
                sizes.get(i % sizes.len().max(1)).map_or(1, |s| *s as usize - 1)
            }
        }
        .clamp(1, max_pairs);

        let mut chain: Vec<u32> = Vec::with_capacity(pairs + 1);
        while chain.len() < pairs + 1 {
            let f = ids[pick.sample(rng) as usize - 1];
            if !chain.contains(&f) {
                chain.push(f);
            }
        }
        for (p, pair) in chain.windows(2).enumerate() {
            let budget = match cfg.distribution {
                LengthDistribution::Fixed if !cfg.randomize_fixed_budget => {
                    cfg.mean_budget.round().max(1.0) as u32
                }
                _ => positive(&budget_dist, rng),
            };
            rows.push(PairRow {
                app,
                pair: p as u32 + 1,
                from: pair[0],
                to: pair[1],
                budget,
            });
        }
    }
    Ok(rows)
}

/// Requests of `requests.users` users random-walking over in-range nodes
/// for `run.duration` intervals. A user keeps its id, chain and revenue.
pub fn user_walks<R: Rng>(
    config: &SimConfig,
    topology: &Topology,
    catalog: &Catalog,
    rng: &mut R,
) -> Result<Vec<Vec<Request>>, LoadError> {
    let duration = config.run.duration as usize;
    let mut intervals = vec![Vec::new(); duration];
    let apps: Vec<AppId> = catalog.apps.keys().copied().collect();
    if apps.is_empty() || topology.is_empty() {
        return Ok(intervals);
    }
    let req = &config.requests;
    let revenue_dist = normal(req.revenue_mean, req.revenue_std.max(0.0))?;
    let app_pick = zipf(apps.len() as u64, FUNCTION_ZIPF_EXPONENT)?;
    let stay = config.mobility.stay_probability;

    for user in 0..req.users {
        let revenue = if req.revenue_std <= 0.0 {
            req.revenue_mean.round().max(0.0) as u32
        } else {
            positive(&revenue_dist, rng)
        };
        let app = apps[app_pick.sample(rng) as usize - 1];
        let mut location = rng.gen_range(0..topology.len());
        for (t, list) in intervals.iter_mut().enumerate() {
            list.push(Request::new(user as RequestId, t as u32, app, location, revenue));
            if rng.gen::<f64>() >= stay {
                let moves: Vec<usize> = topology
                    .neighbors(location)
                    .iter()
                    .copied()
                    .filter(|n| *n != location)
                    .collect();
                if let Some(next) = moves.choose(rng) {
                    location = *next;
                }
            }
        }
    }
    Ok(intervals)
}

/// Transition frequencies between consecutive intervals. The last interval
/// reuses the previous matrix, or the identity for a single interval.
pub fn empirical_matrices(intervals: &[Vec<Request>], nodes: usize) -> Vec<ProbMatrix> {
    let mut matrices = Vec::with_capacity(intervals.len().max(1));
    for pair in intervals.windows(2) {
        let next: BTreeMap<RequestId, usize> =
            pair[1].iter().map(|r| (r.id, r.location)).collect();
        let mut counts = vec![vec![0.0; nodes]; nodes];
        for r in &pair[0] {
            if let Some(dst) = next.get(&r.id) {
                counts[r.location][*dst] += 1.0;
            }
        }
        for row in counts.iter_mut() {
            let total: f64 = row.iter().sum();
            if total > 0.0 {
                row.iter_mut().for_each(|p| *p /= total);
            }
        }
        matrices.push(counts);
    }
    let last = matrices.last().cloned().unwrap_or_else(|| {
        (0..nodes)
            .map(|i| (0..nodes).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect()
    });
    matrices.push(last);
    matrices
}

/// Fraction of intervals each user spends at each node.
pub fn visit_frequencies(intervals: &[Vec<Request>], nodes: usize) -> BTreeMap<RequestId, Vec<f64>> {
    let mut visits: BTreeMap<RequestId, Vec<f64>> = BTreeMap::new();
    for r in intervals.iter().flatten() {
        visits.entry(r.id).or_insert_with(|| vec![0.0; nodes])[r.location] += 1.0;
    }
    for vector in visits.values_mut() {
        let total: f64 = vector.iter().sum();
        vector.iter_mut().for_each(|p| *p /= total);
    }
    visits
}
