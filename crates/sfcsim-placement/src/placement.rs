//! Placement records produced by the coverage heuristic.

use crate::demand::{AppId, FunctionId, RequestId};
use crate::topology::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where one function of one request runs for a given user location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VnfPlace {
    /// Capacity reserved at prediction time.
    Physical { reserved_at: NodeId },
    /// Best-effort, activated when the user actually shows up.
    Dynamic { at: NodeId },
}

impl VnfPlace {
    pub fn node(&self) -> NodeId {
        match *self {
            VnfPlace::Physical { reserved_at } => reserved_at,
            VnfPlace::Dynamic { at } => at,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, VnfPlace::Dynamic { .. })
    }
}

/// Function -> place, for one candidate user location.
pub type ChainAssignment = BTreeMap<FunctionId, VnfPlace>;

/// The full placement of a request: one chain assignment per covered
/// candidate location, plus the physically reserved chain backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPlacement {
    pub request: RequestId,
    pub app: AppId,
    pub origin: NodeId,
    /// Physically reserved `(function, node)` pairs in chain order.
    physical: Vec<(FunctionId, NodeId)>,
    locations: BTreeMap<NodeId, ChainAssignment>,
}

impl RequestPlacement {
    pub fn new(request: RequestId, app: AppId, origin: NodeId) -> Self {
        Self {
            request,
            app,
            origin,
            physical: Vec::new(),
            locations: BTreeMap::new(),
        }
    }

    pub(crate) fn set_physical(&mut self, chain: Vec<(FunctionId, NodeId)>) {
        self.physical = chain;
    }

    /// Record `chain` (functions paired with nodes) at every `covered` location.
    pub(crate) fn cover(
        &mut self,
        covered: &[NodeId],
        chain: &[(FunctionId, NodeId)],
        dynamic: bool,
    ) {
        for location in covered {
            let entry = self.locations.entry(*location).or_default();
            for (function, node) in chain {
                let place = if dynamic {
                    VnfPlace::Dynamic { at: *node }
                } else {
                    VnfPlace::Physical { reserved_at: *node }
                };
                entry.insert(*function, place);
            }
        }
    }

    pub fn physical_chain(&self) -> &[(FunctionId, NodeId)] {
        &self.physical
    }

    pub fn assignment(&self, location: NodeId) -> Option<&ChainAssignment> {
        self.locations.get(&location)
    }

    pub fn locations(&self) -> impl Iterator<Item = (&NodeId, &ChainAssignment)> {
        self.locations.iter()
    }

    pub fn covers(&self, location: NodeId) -> bool {
        self.locations.contains_key(&location)
    }

    pub fn covered_count(&self) -> usize {
        self.locations.len()
    }

    /// Whether any covered location relies on a best-effort allocation.
    pub fn has_dynamic(&self) -> bool {
        self.locations
            .values()
            .any(|a| a.values().any(VnfPlace::is_dynamic))
    }
}
