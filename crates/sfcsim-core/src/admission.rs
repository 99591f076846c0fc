//! Admission control: low-revenue pruning of fanned-out demand and the
//! gap-driven controller that tunes how much demand is admitted.

use crate::config::AdmissionSection;
use sfcsim_placement::{
    Catalog, InputError, InvariantViolation, NodeId, PlacementError, Request, RequestId, Topology,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Instances beyond the previous interval's count that are admitted freely.
const ALLOWED_GROWTH: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PruneParams {
    pub ratio: f64,
    pub max_limit: f64,
    /// Weight a logical request must keep.
    pub acceptance: f64,
    /// Instance count admitted in the previous interval of the same phase.
    pub previous: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneOutcome {
    /// Surviving instances, in input order.
    pub instances: Vec<Request>,
    /// Surviving logical requests.
    pub origins: Vec<Request>,
    /// Every instance considered with its final `used` flag, sorted by id.
    pub considered: Vec<Request>,
}

impl PruneOutcome {
    pub fn dropped(&self) -> usize {
        self.considered.iter().filter(|r| !r.used).count()
    }
}

/// Drop low-value instances until every node's demand fits within
/// `capacity * ratio` and the total respects the growth and absolute caps.
pub fn prune_low_revenue(
    instances: Vec<Request>,
    origins: &[Request],
    topology: &Topology,
    catalog: &Catalog,
    params: PruneParams,
) -> Result<PruneOutcome, PlacementError> {
    let size_of = |r: &Request| -> Result<u32, InputError> {
        catalog
            .app(r.app)
            .map(|a| a.total_size())
            .ok_or(InputError::UnknownApp { request: r.id, app: r.app })
    };

    let mut considered = instances;
    let mut index: BTreeMap<(RequestId, NodeId), usize> = BTreeMap::new();
    let mut by_node: BTreeMap<NodeId, Vec<usize>> = BTreeMap::new();
    let mut demand = vec![0u64; topology.len()];
    for (i, r) in considered.iter_mut().enumerate() {
        if r.location >= topology.len() {
            return Err(InputError::UnknownNode { node: r.location, nodes: topology.len() }.into());
        }
        if index.insert(r.instance_key(), i).is_some() {
            return Err(InvariantViolation::DuplicateInstance {
                request: r.id,
                node: r.location,
            }
            .into());
        }
        r.used = true;
        by_node.entry(r.location).or_default().push(i);
        demand[r.location] += size_of(r)? as u64;
    }

    for (node, list) in by_node.iter_mut() {
        list.sort_by_key(|i| considered[*i].revenue);
        let limit = topology.node(*node).capacity() as f64 * params.ratio;
        let mut cursor = 0;
        while demand[*node] as f64 > limit && cursor < list.len() {
            let i = list[cursor];
            demand[*node] -= size_of(&considered[i])? as u64;
            considered[i].used = false;
            cursor += 1;
        }
    }

    let remaining = considered.iter().filter(|r| r.used).count() as i64;
    let to_drop = (remaining - params.previous as i64 - ALLOWED_GROWTH)
        .max(remaining - params.max_limit as i64);
    if params.previous > 0 && to_drop > 0 {
        let mut alive: Vec<usize> = (0..considered.len()).filter(|i| considered[*i].used).collect();
        alive.sort_by(|a, b| {
            considered[*a]
                .weighted_revenue()
                .total_cmp(&considered[*b].weighted_revenue())
        });
        for i in alive.into_iter().take(to_drop as usize) {
            considered[i].used = false;
        }
    }

    let mut kept_ids = BTreeSet::new();
    for origin in origins {
        let weight: f64 = considered
            .iter()
            .filter(|r| r.id == origin.id && r.used)
            .map(|r| r.weight)
            .sum();
        let any = considered.iter().any(|r| r.id == origin.id && r.used);
        if any && weight >= params.acceptance {
            kept_ids.insert(origin.id);
        }
    }
    for r in considered.iter_mut() {
        if !kept_ids.contains(&r.id) {
            r.used = false;
        }
    }

    let kept: Vec<Request> = considered.iter().filter(|r| r.used).cloned().collect();
    let kept_origins: Vec<Request> = origins
        .iter()
        .filter(|r| kept_ids.contains(&r.id))
        .cloned()
        .collect();
    considered.sort_by_key(|r| r.id);
    let outcome = PruneOutcome {
        instances: kept,
        origins: kept_origins,
        considered,
    };
    info!(
        kept = outcome.instances.len(),
        dropped = outcome.dropped(),
        origins = outcome.origins.len(),
        ratio = params.ratio,
        "pruned low-revenue demand"
    );
    Ok(outcome)
}

/// Ratio and limit of one phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionState {
    pub ratio: f64,
    pub max_limit: f64,
    pub previous: usize,
}

impl AdmissionState {
    pub fn params(&self, acceptance: f64) -> PruneParams {
        PruneParams {
            ratio: self.ratio,
            max_limit: self.max_limit,
            acceptance,
            previous: self.previous,
        }
    }
}

/// Separate admission states for estimated and realized demand.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveController {
    pub estimated: AdmissionState,
    pub actual: AdmissionState,
    pub acceptable_gap: f64,
}

impl AdaptiveController {
    pub fn new(cfg: &AdmissionSection, initial_capacity: u32) -> Self {
        let limit = initial_capacity as f64;
        let ratio = cfg.capacity_ratio_threshold / 2.0;
        let previous = (initial_capacity / 2) as usize;
        Self {
            estimated: AdmissionState { ratio, max_limit: limit, previous },
            actual: AdmissionState { ratio, max_limit: limit / 4.0, previous },
            acceptable_gap: cfg.acceptable_gap,
        }
    }

    /// Feed a solve's gap back into `state`.
    pub fn observe(
        acceptable_gap: f64,
        state: &mut AdmissionState,
        gap: f64,
        requests: usize,
        allocated: usize,
        t: u32,
    ) -> Result<(), InvariantViolation> {
        let (ratio, max_limit) =
            update_gap(gap, acceptable_gap, state.ratio, state.max_limit, requests, allocated, t)?;
        if ratio != state.ratio || max_limit != state.max_limit {
            debug!(gap, old_ratio = state.ratio, ratio, max_limit, "admission adapted");
        }
        state.ratio = ratio;
        state.max_limit = max_limit;
        Ok(())
    }
}

/// New `(ratio, max_limit)` after a solve that ended with `gap`.
pub fn update_gap(
    gap: f64,
    acceptable: f64,
    ratio: f64,
    max_limit: f64,
    requests: usize,
    allocated: usize,
    t: u32,
) -> Result<(f64, f64), InvariantViolation> {
    let mut ratio = ratio;
    if gap < acceptable {
        if ratio <= 1.5 {
            ratio += 0.25;
        }
    } else if gap > 1.0 && ratio >= 2.0 {
        ratio *= 0.75;
    } else if gap > 10.0 * acceptable {
        if ratio > 1.0 {
            ratio -= 0.5;
        } else if ratio > 0.5 {
            ratio -= 0.25;
        } else if ratio > 0.25 {
            ratio -= 0.125;
        } else if ratio > 1.0 / 16.0 {
            ratio -= 1.0 / 16.0;
        }
    }

    let mut max_limit = max_limit;
    if requests > 100 && allocated < 10 && t >= 3 && max_limit > requests as f64 {
        let limit = requests as i64 - 20;
        if limit < 0 {
            return Err(InvariantViolation::NegativeLimit { limit });
        }
        max_limit = limit as f64;
        info!(max_limit, "admission limit lowered");
    }
    Ok((ratio, max_limit))
}
