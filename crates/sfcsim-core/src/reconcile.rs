//! Carry predicted reservations into the realized interval.
//!
//! The Predict phase leaves a [`PredictionState`]: the topology it reserved
//! against, the ledger of its slots, the solved outcome and a book of
//! reservations keyed by `(node, app)`. [`reconcile`] matches realized
//! requests against that book before the Adjust model places what is left.

use serde::{Deserialize, Serialize};
use sfcsim_placement::{
    AppId, Catalog, ExactOutcome, InvariantViolation, LinkSlot, ModelKind, NodeId, NodeSlot,
    Phase, PlacementError, Request, RequestId, ReservationLedger, Topology,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One accepted fan-out instance and the slots it may hand over.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Logical request whose ledger slots back this reservation.
    pub holder: RequestId,
    pub app: AppId,
    /// Location of the accepted instance the slots were solved for.
    pub instance_location: NodeId,
    pub revenue: u32,
    pub weight: f64,
    /// Endpoint hops reserved when the reservation was redirected.
    pub redirect_links: BTreeSet<(u32, NodeId, NodeId)>,
    pub redirected: bool,
}

impl Reservation {
    pub fn benefit(&self) -> f64 {
        self.revenue as f64 * self.weight
    }
}

/// Reservations per `(node, app)`, highest benefit first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReservationBook {
    slots: BTreeMap<(NodeId, AppId), Vec<Reservation>>,
}

impl ReservationBook {
    /// Book every accepted instance of `outcome`.
    pub fn from_outcome(outcome: &ExactOutcome, instances: &[Request]) -> Self {
        let mut book = Self::default();
        for instance in instances {
            if outcome.is_accepted(instance.id, instance.location) {
                book.insert(
                    instance.location,
                    Reservation {
                        holder: instance.id,
                        app: instance.app,
                        instance_location: instance.location,
                        revenue: instance.revenue,
                        weight: instance.weight,
                        redirect_links: BTreeSet::new(),
                        redirected: false,
                    },
                );
            }
        }
        book
    }

    pub fn insert(&mut self, node: NodeId, reservation: Reservation) {
        let list = self.slots.entry((node, reservation.app)).or_default();
        let at = list
            .iter()
            .position(|r| r.benefit() < reservation.benefit())
            .unwrap_or(list.len());
        list.insert(at, reservation);
    }

    pub fn at(&self, node: NodeId, app: AppId) -> &[Reservation] {
        self.slots.get(&(node, app)).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn holds(&self, node: NodeId, app: AppId, holder: RequestId) -> bool {
        self.at(node, app).iter().any(|r| r.holder == holder)
    }

    pub fn take(&mut self, node: NodeId, app: AppId, holder: RequestId) -> Option<Reservation> {
        let list = self.slots.get_mut(&(node, app))?;
        let at = list.iter().position(|r| r.holder == holder)?;
        Some(list.remove(at))
    }

    /// The highest-benefit reservation at `(node, app)` whose holder is unused.
    pub fn take_best_unused(
        &mut self,
        node: NodeId,
        app: AppId,
        unused: &BTreeSet<RequestId>,
    ) -> Option<Reservation> {
        let list = self.slots.get_mut(&(node, app))?;
        let at = list.iter().position(|r| unused.contains(&r.holder))?;
        Some(list.remove(at))
    }

    pub fn remove_holder(&mut self, holder: RequestId) {
        for list in self.slots.values_mut() {
            list.retain(|r| r.holder != holder);
        }
        self.slots.retain(|_, list| !list.is_empty());
    }

    pub fn len(&self) -> usize {
        self.slots.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Everything a Predict phase leaves for the following Adjust.
#[derive(Debug, Clone)]
pub struct PredictionState {
    pub topology: Topology,
    pub ledger: ReservationLedger,
    pub outcome: ExactOutcome,
    pub book: ReservationBook,
    /// Whether each logical request of the prediction was placed.
    pub placed: BTreeMap<RequestId, bool>,
}

impl PredictionState {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            ledger: ReservationLedger::new(),
            outcome: ExactOutcome::empty(ModelKind::Preallocate),
            book: ReservationBook::default(),
            placed: BTreeMap::new(),
        }
    }

    /// Record a solved Predict model whose slots were committed already.
    pub fn record(&mut self, outcome: ExactOutcome, instances: &[Request]) {
        let placed = outcome.placed();
        for instance in instances {
            *self.placed.entry(instance.id).or_insert(false) |= placed.contains(&instance.id);
        }
        self.book = ReservationBook::from_outcome(&outcome, instances);
        self.outcome = outcome;
    }
}

/// Reserve the slots of every placed request of `outcome`. Returns the
/// migration cost each placed request pays, taken before residency moves.
pub fn commit(
    topology: &mut Topology,
    ledger: &mut ReservationLedger,
    outcome: &ExactOutcome,
    catalog: &Catalog,
    phase: Phase,
) -> Result<BTreeMap<RequestId, u32>, InvariantViolation> {
    let mut paid = BTreeMap::new();
    for request in outcome.placed() {
        let functions = outcome.functions_of(request);
        let cost = functions
            .iter()
            .map(|(node, function)| topology.node(*node).launch_cost(request, *function))
            .sum();
        paid.insert(request, cost);
        for (node, function) in functions {
            let slot = NodeSlot { phase, request, node, function };
            ledger.reserve(topology, slot, catalog.size(function))?;
        }
        for (pair, src, dst) in outcome.links_of(request) {
            let slot = LinkSlot { phase, request, pair, src, dst };
            ledger.reserve_link(topology, slot)?;
        }
    }
    Ok(paid)
}

/// Mark every function of every modelled request resident exactly where the
/// solve assigned it.
pub fn update_residency(
    topology: &mut Topology,
    outcome: &ExactOutcome,
    requests: &[Request],
    catalog: &Catalog,
) {
    let mut seen = BTreeSet::new();
    for request in requests {
        if !seen.insert(request.id) {
            continue;
        }
        let Some(app) = catalog.app(request.app) else {
            continue;
        };
        for function in app.functions() {
            for node in 0..topology.len() {
                let resident = outcome.assignment.contains(&(request.id, node, *function));
                topology
                    .node_mut(node)
                    .set_resident(request.id, *function, resident);
            }
        }
    }
}

/// A realized request served by a reservation from the prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedRequest {
    pub request: Request,
    pub holder: RequestId,
    /// The request's own prediction covered it.
    pub predicted: bool,
    pub redirected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub served: usize,
    pub placed: usize,
    pub repurposed: usize,
    pub redirected: usize,
    pub missed: usize,
    pub expired: usize,
    pub new: usize,
}

impl std::ops::AddAssign for ReconcileCounts {
    fn add_assign(&mut self, other: Self) {
        self.served += other.served;
        self.placed += other.placed;
        self.repurposed += other.repurposed;
        self.redirected += other.redirected;
        self.missed += other.missed;
        self.expired += other.expired;
        self.new += other.new;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub served: Vec<ServedRequest>,
    /// Realized requests left for the Adjust model.
    pub to_serve: Vec<Request>,
    pub counts: ReconcileCounts,
}

/// Match realized demand against the prediction's reservations.
pub fn reconcile(
    state: &mut PredictionState,
    actual: &[Request],
    catalog: &Catalog,
    check_broken_chains: bool,
) -> Result<Reconciliation, PlacementError> {
    let mut result = Reconciliation::default();
    result.counts.placed = state.placed.values().filter(|p| **p).count();

    let mut unused: BTreeSet<RequestId> = BTreeSet::new();
    let mut groups: BTreeMap<(NodeId, AppId), Vec<&Request>> = BTreeMap::new();
    let realized: BTreeSet<RequestId> = actual.iter().map(|r| r.id).collect();

    for request in actual {
        match state.placed.get(&request.id) {
            Some(true) if !state.outcome.is_accepted(request.id, request.location) => {
                if check_broken_chains && redirect(state, catalog, request)? {
                    result.counts.redirected += 1;
                } else {
                    unused.insert(request.id);
                }
            }
            Some(_) => {}
            None => result.counts.new += 1,
        }
        groups
            .entry((request.location, request.app))
            .or_default()
            .push(request);
    }

    let expired: Vec<RequestId> = state
        .placed
        .iter()
        .filter(|(id, placed)| **placed && !realized.contains(id))
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        result.counts.expired += 1;
        unused.insert(id);
        state.topology.forget_request(id);
    }

    for ((node, app), mut requests) in groups {
        requests.sort_by(|a, b| b.revenue.cmp(&a.revenue).then(a.id.cmp(&b.id)));
        for request in requests {
            let (reservation, predicted) = match state.book.take(node, app, request.id) {
                Some(own) => (own, true),
                None => match state.book.take_best_unused(node, app, &unused) {
                    Some(other) => (other, false),
                    None => {
                        result.counts.missed += 1;
                        result.to_serve.push(request.clone());
                        continue;
                    }
                },
            };
            hand_over(state, catalog, &reservation)?;
            unused.remove(&reservation.holder);
            if predicted {
                result.counts.served += 1;
            } else {
                result.counts.repurposed += 1;
                debug!(
                    request = request.id,
                    holder = reservation.holder,
                    node,
                    "reservation repurposed"
                );
            }
            result.served.push(ServedRequest {
                request: request.clone(),
                holder: reservation.holder,
                predicted,
                redirected: reservation.redirected,
            });
        }
    }

    for holder in &unused {
        state.ledger.release_request(&mut state.topology, *holder)?;
        state.book.remove_holder(*holder);
    }

    let c = result.counts;
    info!(
        served = c.served,
        placed = c.placed,
        repurposed = c.repurposed,
        redirected = c.redirected,
        missed = c.missed,
        expired = c.expired,
        new = c.new,
        "reconciled prediction"
    );
    Ok(result)
}

/// Keep only the slots `reservation` needs and drop its holder from the book.
fn hand_over(
    state: &mut PredictionState,
    catalog: &Catalog,
    reservation: &Reservation,
) -> Result<(), InvariantViolation> {
    let holder = reservation.holder;
    let location = reservation.instance_location;
    let keep_nodes = state.outcome.instance_functions(holder, location);
    let mut keep_links = state.outcome.instance_links(holder, location);
    if reservation.redirected {
        let pairs = catalog
            .app(reservation.app)
            .map(|a| a.real_pairs() as u32)
            .unwrap_or(0);
        keep_links.retain(|(p, _, _)| (1..=pairs).contains(p));
        keep_links.extend(reservation.redirect_links.iter().copied());
    }
    state
        .ledger
        .release_except(&mut state.topology, holder, &keep_nodes, &keep_links)?;
    state.book.remove_holder(holder);
    Ok(())
}

/// Try to move a reservation of `request` from a neighbour to the node the
/// user actually occupies. Returns whether it moved.
fn redirect(
    state: &mut PredictionState,
    catalog: &Catalog,
    request: &Request,
) -> Result<bool, InvariantViolation> {
    let Some(app) = catalog.app(request.app) else {
        return Ok(false);
    };
    let here = request.location;
    let pairs = app.real_pairs();
    let first = app.first();
    let last = app.last();
    let topo = &state.topology;

    let candidate = topo.neighbors(here).iter().copied().find(|n| {
        if *n == here
            || !state.outcome.is_accepted(request.id, *n)
            || !state.book.holds(*n, request.app, request.id)
        {
            return false;
        }
        let node_of = |f| state.outcome.node_of(request.id, *n, f);
        let (Some(first_node), Some(last_node)) = (node_of(first), node_of(last)) else {
            return false;
        };
        for f in app.functions() {
            match node_of(*f) {
                Some(d) if topo.in_range(here, d) => {}
                _ => return false,
            }
        }
        for p in 1..=pairs {
            let segment = app.segment(p);
            let (Some(a), Some(b)) = (node_of(segment.from), node_of(segment.to)) else {
                return false;
            };
            let mut delay = topo.delay(a, b)
                + topo.proc_delay(a, catalog.size(segment.from))
                + topo.proc_delay(b, catalog.size(segment.to));
            if p == 1 {
                delay += topo.delay(here, first_node);
            }
            if p == pairs {
                delay += topo.delay(last_node, here);
            }
            if delay > segment.budget {
                return false;
            }
        }
        (here == first_node || topo.has_bandwidth(here, first_node))
            && (here == last_node || topo.has_bandwidth(last_node, here))
    });
    let Some(from) = candidate else {
        return Ok(false);
    };

    let Some(mut reservation) = state.book.take(from, request.app, request.id) else {
        return Ok(false);
    };
    let (Some(first_node), Some(last_node)) = (
        state.outcome.node_of(request.id, from, first),
        state.outcome.node_of(request.id, from, last),
    ) else {
        return Ok(false);
    };
    let hops = [(0u32, here, first_node), (pairs as u32 + 1, last_node, here)];
    for (pair, src, dst) in hops {
        if src == dst {
            continue;
        }
        let slot = LinkSlot {
            phase: Phase::Adjust,
            request: request.id,
            pair,
            src,
            dst,
        };
        state.ledger.reserve_link(&mut state.topology, slot)?;
        reservation.redirect_links.insert((pair, src, dst));
    }
    reservation.redirected = true;
    state.book.insert(here, reservation);
    debug!(request = request.id, from, to = here, "reservation redirected");
    Ok(true)
}
