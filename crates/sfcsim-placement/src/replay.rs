//! Realize committed heuristic placements against the locations users
//! actually occupy.

use crate::demand::{Catalog, Request, RequestId, USER};
use crate::error::{InputError, InvariantViolation, PlacementError};
use crate::placement::RequestPlacement;
use crate::reservation::ReservationTxn;
use crate::topology::{NodeId, Topology};
use std::collections::BTreeMap;
use tracing::debug;

/// Result of one replay pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayOutcome {
    /// Whether each request was served end to end.
    pub placed: BTreeMap<RequestId, bool>,
    /// Location each placed-or-attempted request was realized at.
    pub realized: BTreeMap<RequestId, NodeId>,
    /// Physically reserved volume per node that did not serve its user.
    pub static_unused: Vec<u32>,
}

impl ReplayOutcome {
    pub fn placed_count(&self) -> usize {
        self.placed.values().filter(|p| **p).count()
    }
}

/// Serve `requests` (highest revenue first) from `placements`.
///
/// For every request the assignment at its realized location is activated:
/// dynamic functions take capacity now, and every hop between distinct nodes
/// consumes one unit of bandwidth. Any failure rolls the whole request back.
/// `location_error` is drawn once per placed request; when it fires the user
/// is moved to the next node not covered by the placement.
pub fn replay<F>(
    catalog: &Catalog,
    topology: &mut Topology,
    requests: &[Request],
    placements: &BTreeMap<RequestId, RequestPlacement>,
    mut location_error: F,
) -> Result<ReplayOutcome, PlacementError>
where
    F: FnMut() -> bool,
{
    let n = topology.len();
    let mut outcome = ReplayOutcome {
        static_unused: vec![0; n],
        ..Default::default()
    };
    let mut ordered: Vec<&Request> = requests.iter().collect();
    ordered.sort_by(|a, b| b.revenue.cmp(&a.revenue));

    for request in ordered {
        let Some(placement) = placements.get(&request.id) else {
            outcome.placed.insert(request.id, false);
            continue;
        };
        let app = catalog.app(request.app).ok_or(InputError::UnknownApp {
            request: request.id,
            app: request.app,
        })?;

        let mut location = request.location;
        if location_error() && n > 0 {
            location = (location + 1) % n;
            let mut steps = 1;
            while placement.covers(location) && steps < n {
                location = (location + 1) % n;
                steps += 1;
            }
        }
        outcome.realized.insert(request.id, location);

        let Some(assignment) = placement.assignment(location) else {
            outcome.placed.insert(request.id, false);
            add_unused(&mut outcome.static_unused, catalog, placement);
            continue;
        };
        let mut nodes = BTreeMap::new();
        for function in app.functions() {
            let place = assignment.get(function).ok_or_else(|| {
                InvariantViolation::MissingReservation {
                    request: request.id,
                    detail: format!("function {function} has no place at node {location}"),
                }
            })?;
            nodes.insert(*function, *place);
        }

        let mut txn = ReservationTxn::new();
        let mut served = true;
        for function in app.functions() {
            let place = nodes[function];
            if place.is_dynamic() && !txn.activate(topology, place.node(), catalog.size(*function))? {
                served = false;
                break;
            }
        }
        if served {
            let node_of = |f: u32| if f == USER { location } else { nodes[&f].node() };
            for segment in app.segments() {
                let (a, b) = (node_of(segment.from), node_of(segment.to));
                if a == b {
                    continue;
                }
                if topology.link(a, b).is_none() || !txn.consume_link(topology, a, b, 1)? {
                    served = false;
                    break;
                }
            }
        }

        let dynamic = nodes.values().any(|p| p.is_dynamic());
        if served {
            txn.commit();
        } else {
            txn.rollback(topology)?;
        }
        if dynamic || !served {
            add_unused(&mut outcome.static_unused, catalog, placement);
        }
        debug!(request = request.id, location, served, dynamic, "replayed request");
        outcome.placed.insert(request.id, served);
    }
    Ok(outcome)
}

fn add_unused(unused: &mut [u32], catalog: &Catalog, placement: &RequestPlacement) {
    for (function, node) in placement.physical_chain() {
        unused[*node] += catalog.size(*function);
    }
}
