//! Greedy coverage-maximizing chain placement.
//!
//! Given a request and a probability vector over its possible next
//! locations, the heuristic:
//!
//! 1. Picks the first-function node that covers the most probability mass
//!    within the first segment's budget and reserves it.
//! 2. Continues the chain preferring the previous node, then the origin, then
//!    any node linked to the previous one.
//! 3. Keeps only the covered locations for which the resulting chain meets
//!    every segment budget.
//! 4. Serves the still uncovered locations with best-effort (dynamic)
//!    chains anchored at the most probable of them.
//!
//! Infeasibility is reported as `Ok(None)` with the topology untouched.

use crate::demand::{App, Catalog, FunctionId, Request};
use crate::error::{InputError, InvariantViolation, PlacementError};
use crate::placement::RequestPlacement;
use crate::reservation::ReservationTxn;
use crate::topology::{NodeId, Topology};
use std::collections::BTreeSet;
use tracing::debug;

/// Placement mode of one search pass.
enum Mode<'t> {
    /// Capacity is checked and reserved through the transaction.
    Physical(&'t mut ReservationTxn),
    /// Feasibility is checked but nothing is reserved.
    Dynamic,
}

impl Mode<'_> {
    fn is_physical(&self) -> bool {
        matches!(self, Mode::Physical(_))
    }
}

/// Outcome of continuing a chain past its first function.
#[derive(Debug, PartialEq)]
enum ChainSearch {
    Placed(Vec<NodeId>),
    /// The chain cannot return to the user from the chosen first node.
    Retry,
    Failed,
}

/// The coverage heuristic over a fixed function/chain catalogue.
pub struct CoverageHeuristic<'a> {
    catalog: &'a Catalog,
}

impl<'a> CoverageHeuristic<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Place `request` for every location with non-zero probability in
    /// `probs`. Physical reservations are applied to `topology` only when a
    /// placement is returned.
    pub fn place(
        &self,
        topology: &mut Topology,
        request: &Request,
        probs: &[f64],
    ) -> Result<Option<RequestPlacement>, PlacementError> {
        if probs.len() != topology.len() {
            return Err(InputError::ProbabilityRowMismatch {
                row: request.location,
                got: probs.len(),
                expected: topology.len(),
            }
            .into());
        }
        let app = self.catalog.app(request.app).ok_or(InputError::UnknownApp {
            request: request.id,
            app: request.app,
        })?;
        let origin = request.location;
        let first = app.first();

        // Physical pass
        let mut excluded = BTreeSet::new();
        let (physical, covered) = loop {
            let Some(candidates) =
                self.largest_covering_first_node(topology, probs, app, origin, true, &excluded)
            else {
                debug!(request = request.id, "no physical first-function node");
                return Ok(None);
            };
            let first_node = candidates[0];
            let mut txn = ReservationTxn::new();
            txn.reserve(topology, first_node, self.catalog.size(first))?;
            let budgets = self.continuation_budgets(topology, app, origin, first_node);
            let search = self.place_chain(
                topology,
                &mut Mode::Physical(&mut txn),
                origin,
                first_node,
                &app.functions()[1..],
                &budgets,
            )?;
            let ChainSearch::Placed(rest) = search else {
                txn.rollback(topology)?;
                excluded.insert(first_node);
                continue;
            };
            let mut placed = vec![first_node];
            placed.extend(rest);
            if candidates.contains(&origin) && !self.is_placement_legal(topology, app, origin, &placed) {
                txn.rollback(topology)?;
                excluded.insert(first_node);
                continue;
            }
            let covered: Vec<NodeId> = candidates
                .into_iter()
                .filter(|d| self.is_placement_legal(topology, app, *d, &placed))
                .collect();
            txn.commit();
            break (placed, covered);
        };

        let mut placement = RequestPlacement::new(request.id, request.app, origin);
        let chain: Vec<(FunctionId, NodeId)> =
            app.functions().iter().copied().zip(physical).collect();
        placement.set_physical(chain.clone());
        placement.cover(&covered, &chain, false);

        // Dynamic pass over whatever the physical chain left uncovered
        let mut optional: Vec<NodeId> = (0..probs.len())
            .filter(|d| probs[*d] > 0.0 && !covered.contains(d))
            .collect();
        while let Some(anchor) = most_probable(&optional, probs) {
            let temp: Vec<f64> = (0..probs.len())
                .map(|d| if optional.contains(&d) { probs[d] } else { 0.0 })
                .collect();
            let mut excluded = BTreeSet::new();
            loop {
                let Some(candidates) =
                    self.largest_covering_first_node(topology, &temp, app, anchor, false, &excluded)
                else {
                    optional.retain(|d| *d != anchor);
                    break;
                };
                let first_node = candidates[0];
                let budgets = self.continuation_budgets(topology, app, anchor, first_node);
                let search = self.place_chain(
                    topology,
                    &mut Mode::Dynamic,
                    anchor,
                    first_node,
                    &app.functions()[1..],
                    &budgets,
                )?;
                match search {
                    ChainSearch::Failed => {
                        optional.retain(|d| *d != anchor);
                        break;
                    }
                    ChainSearch::Retry => {
                        excluded.insert(first_node);
                    }
                    ChainSearch::Placed(rest) => {
                        let mut placed = vec![first_node];
                        placed.extend(rest);
                        if !self.is_placement_legal(topology, app, anchor, &placed) {
                            excluded.insert(first_node);
                            continue;
                        }
                        let covered: Vec<NodeId> = candidates
                            .into_iter()
                            .filter(|d| self.is_placement_legal(topology, app, *d, &placed))
                            .collect();
                        let chain: Vec<(FunctionId, NodeId)> =
                            app.functions().iter().copied().zip(placed).collect();
                        placement.cover(&covered, &chain, true);
                        optional.retain(|d| !covered.contains(d));
                        break;
                    }
                }
            }
        }

        debug!(
            request = request.id,
            covered = placement.covered_count(),
            dynamic = placement.has_dynamic(),
            "heuristic placement"
        );
        Ok(Some(placement))
    }

    /// Free the physical chain backing `placement`.
    pub fn release(
        &self,
        topology: &mut Topology,
        placement: &RequestPlacement,
    ) -> Result<(), InvariantViolation> {
        if placement.physical_chain().is_empty() {
            return Err(InvariantViolation::MissingReservation {
                request: placement.request,
                detail: "no physical chain to release".to_string(),
            });
        }
        for (function, node) in placement.physical_chain() {
            topology.release(*node, self.catalog.size(*function))?;
        }
        Ok(())
    }

    /// Budgets for `f_2..=f_{n+1}`: what segment 1 has left after the first
    /// function, then the budgets of segments `2..=n`.
    fn continuation_budgets(
        &self,
        topology: &Topology,
        app: &App,
        src: NodeId,
        first_node: NodeId,
    ) -> Vec<i64> {
        let first_cost = topology.proc_delay(first_node, self.catalog.size(app.first()))
            + topology.delay(src, first_node);
        let mut budgets = vec![app.budget(1) as i64 - first_cost as i64];
        budgets.extend((2..=app.real_pairs()).map(|i| app.budget(i) as i64));
        budgets
    }

    /// Choose the node for the first function that covers the most
    /// probability. Returns `[chosen, covered...]`, or `None` when no node can
    /// host the first function.
    fn largest_covering_first_node(
        &self,
        topology: &Topology,
        probs: &[f64],
        app: &App,
        src: NodeId,
        physical: bool,
        excluded: &BTreeSet<NodeId>,
    ) -> Option<Vec<NodeId>> {
        let function = app.first();
        let size = self.catalog.size(function);
        let budget = app.budget(1) as i64;
        let coverage: Vec<NodeId> = (0..probs.len()).filter(|d| probs[*d] > 0.0).collect();
        let proc = |d: NodeId| topology.proc_delay(d, size) as i64;

        let mut legal = Vec::new();
        if (!physical || topology.node(src).has_room(size))
            && !excluded.contains(&src)
            && probs[src] > 0.0
            && proc(src) <= budget
        {
            legal.push(src);
        }
        for &d in &coverage {
            if d == src || excluded.contains(&d) {
                continue;
            }
            if physical && !topology.node(d).has_room(size) {
                continue;
            }
            let delay = topology.delay(src, d) as i64;
            if delay == 0 || delay + proc(d) > budget || !topology.has_bandwidth(src, d) {
                continue;
            }
            legal.push(d);
        }

        let mut best: Option<(f64, Vec<NodeId>)> = None;
        for &candidate in &legal {
            let mut mass = probs[candidate];
            let mut covered = vec![candidate];
            for &c in &coverage {
                if c == candidate {
                    continue;
                }
                let delay = topology.delay(c, candidate) as i64;
                if delay == 0 || delay > budget {
                    continue;
                }
                mass += probs[c];
                covered.push(c);
            }
            if best.as_ref().map_or(mass > 0.0, |(m, _)| mass > *m) {
                best = Some((mass, covered));
            }
        }
        best.map(|(_, covered)| covered)
    }

    /// Nodes that may host the function after one placed at `d`: `d` itself and
    /// every node reachable over a link with bandwidth, all with spare capacity.
    fn legal_next_nodes(&self, topology: &Topology, d: NodeId) -> Vec<NodeId> {
        (0..topology.len())
            .filter(|&i| topology.node(i).capacity() > 0 && (i == d || topology.has_bandwidth(d, i)))
            .collect()
    }

    fn place_chain(
        &self,
        topology: &mut Topology,
        mode: &mut Mode<'_>,
        src: NodeId,
        first_node: NodeId,
        functions: &[FunctionId],
        budgets: &[i64],
    ) -> Result<ChainSearch, InvariantViolation> {
        let mut placed = Vec::with_capacity(functions.len());
        let mut prev = first_node;
        for (i, (&function, &budget)) in functions.iter().zip(budgets).enumerate() {
            let size = self.catalog.size(function);
            let is_last = i + 1 == functions.len();
            let physical = mode.is_physical();
            let fits = |topology: &Topology, d: NodeId| !physical || topology.node(d).has_room(size);
            let proc = |topology: &Topology, d: NodeId| topology.proc_delay(d, size) as i64;
            let mut feasible = self.legal_next_nodes(topology, prev);
            let mut chosen = None;

            // Same node as the previous function
            if let Some(pos) = feasible.iter().position(|d| *d == prev) {
                feasible.remove(pos);
                if fits(topology, prev) {
                    if is_last {
                        if topology.delay(prev, src) as i64 + proc(topology, prev) > budget {
                            return Ok(ChainSearch::Retry);
                        }
                        chosen = Some(prev);
                    } else if proc(topology, prev) <= budget {
                        chosen = Some(prev);
                    }
                }
            }

            // The user's node
            if chosen.is_none() && prev != src {
                if let Some(pos) = feasible.iter().position(|d| *d == src) {
                    feasible.remove(pos);
                    let cost = topology.delay(prev, src) as i64 + proc(topology, src);
                    if fits(topology, src) && cost <= budget {
                        chosen = Some(src);
                    }
                }
            }

            // Any node linked to the previous one, lowest id first
            for &d in &feasible {
                if chosen.is_some() {
                    break;
                }
                if !topology.has_bandwidth(d, src) || !fits(topology, d) {
                    continue;
                }
                let cost = topology.delay(prev, d) as i64 + proc(topology, d);
                if cost > budget {
                    continue;
                }
                if is_last && topology.delay(d, src) as i64 + cost > budget {
                    continue;
                }
                chosen = Some(d);
            }

            let Some(node) = chosen else {
                return Ok(ChainSearch::Failed);
            };
            if let Mode::Physical(txn) = mode {
                txn.reserve(topology, node, size)?;
            }
            placed.push(node);
            prev = node;
        }
        Ok(ChainSearch::Placed(placed))
    }

    /// Whether the chain `placed` (one node per function) meets every segment
    /// budget for a user located at `src`.
    pub fn is_placement_legal(
        &self,
        topology: &Topology,
        app: &App,
        src: NodeId,
        placed: &[NodeId],
    ) -> bool {
        let n = app.real_pairs();
        if placed.len() != n + 1 {
            return false;
        }
        let mut hops = Vec::with_capacity(n + 2);
        hops.push((src, placed[0]));
        hops.extend(placed.windows(2).map(|w| (w[0], w[1])));
        hops.push((placed[n], src));

        let mut phys = Vec::with_capacity(hops.len());
        for (a, b) in hops {
            if a == b {
                phys.push(0);
            } else if !topology.in_range(a, b) {
                return false;
            } else {
                phys.push(topology.delay(a, b) as i64);
            }
        }
        let functions = app.functions();
        let proc =
            |i: usize| topology.proc_delay(placed[i], self.catalog.size(functions[i])) as i64;

        // Segment i pays the hop into f_{i+1} and its processing; segment 1
        // also pays the first function, segment n the hop back to the user.
        (1..=n).all(|i| {
            let mut total = phys[i] + proc(i);
            if i == 1 {
                total += phys[0] + proc(0);
            }
            if i == n {
                total += phys[n + 1];
            }
            total <= app.budget(i) as i64
        })
    }
}

fn most_probable(optional: &[NodeId], probs: &[f64]) -> Option<NodeId> {
    let mut best: Option<NodeId> = None;
    for &d in optional {
        if best.map_or(true, |b| probs[d] > probs[b]) {
            best = Some(d);
        }
    }
    best
}
