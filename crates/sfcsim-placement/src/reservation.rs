//! Transactional capacity and bandwidth reservation.
//!
//! ```text
//!   ReservationTxn   one placement attempt: tentative entries, rolled back
//!                    in reverse order on failure, or committed
//!   ReservationLedger  committed slots keyed by (phase, request, node, function)
//!                      and (phase, request, pair, link), owned by the interval loop
//! ```

use crate::demand::{FunctionId, RequestId};
use crate::error::InvariantViolation;
use crate::topology::{NodeId, Topology};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single tentative mutation of the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnEntry {
    Node { node: NodeId, size: u32 },
    Dynamic { node: NodeId, size: u32 },
    Link { src: NodeId, dst: NodeId, units: u32 },
}

/// Log of tentative reservations for one placement attempt.
#[derive(Debug, Default)]
pub struct ReservationTxn {
    entries: Vec<TxnEntry>,
}

impl ReservationTxn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TxnEntry] {
        &self.entries
    }

    pub fn reserve(
        &mut self,
        topology: &mut Topology,
        node: NodeId,
        size: u32,
    ) -> Result<(), InvariantViolation> {
        topology.reserve(node, size)?;
        self.entries.push(TxnEntry::Node { node, size });
        Ok(())
    }

    /// Activate a dynamic allocation; `Ok(false)` when the node lacks headroom.
    pub fn activate(
        &mut self,
        topology: &mut Topology,
        node: NodeId,
        size: u32,
    ) -> Result<bool, InvariantViolation> {
        if topology.node_mut(node).activate_dynamic(size)? {
            self.entries.push(TxnEntry::Dynamic { node, size });
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consume bandwidth; `Ok(false)` when the link cannot carry `units`.
    pub fn consume_link(
        &mut self,
        topology: &mut Topology,
        src: NodeId,
        dst: NodeId,
        units: u32,
    ) -> Result<bool, InvariantViolation> {
        let Some(link) = topology.link(src, dst) else {
            return Err(InvariantViolation::MissingLink { src, dst });
        };
        if link.bandwidth() < units {
            return Ok(false);
        }
        topology.consume(src, dst, units)?;
        self.entries.push(TxnEntry::Link { src, dst, units });
        Ok(true)
    }

    /// Undo every entry, most recent first.
    pub fn rollback(mut self, topology: &mut Topology) -> Result<(), InvariantViolation> {
        while let Some(entry) = self.entries.pop() {
            match entry {
                TxnEntry::Node { node, size } => topology.release(node, size)?,
                TxnEntry::Dynamic { node, size } => {
                    topology.node_mut(node).deactivate_dynamic(size)?
                }
                TxnEntry::Link { src, dst, units } => topology.restore(src, dst, units)?,
            }
        }
        Ok(())
    }

    pub fn commit(self) -> Vec<TxnEntry> {
        self.entries
    }
}

/// Which interval phase created a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Predict,
    Adjust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeSlot {
    pub phase: Phase,
    pub request: RequestId,
    pub node: NodeId,
    pub function: FunctionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkSlot {
    pub phase: Phase,
    pub request: RequestId,
    pub pair: u32,
    pub src: NodeId,
    pub dst: NodeId,
}

/// Committed reservations. Every slot holds capacity (or one bandwidth unit)
/// on the topology it was reserved against; releasing a slot twice is a no-op.
#[derive(Debug, Default, Clone)]
pub struct ReservationLedger {
    nodes: BTreeMap<NodeSlot, u32>,
    links: BTreeSet<LinkSlot>,
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.links.is_empty()
    }

    pub fn node_slots(&self) -> impl Iterator<Item = (&NodeSlot, &u32)> {
        self.nodes.iter()
    }

    pub fn link_slots(&self) -> impl Iterator<Item = &LinkSlot> {
        self.links.iter()
    }

    pub fn holds(&self, slot: &NodeSlot) -> bool {
        self.nodes.contains_key(slot)
    }

    pub fn holds_link(&self, slot: &LinkSlot) -> bool {
        self.links.contains(slot)
    }

    pub fn has_request(&self, request: RequestId) -> bool {
        self.nodes.keys().any(|s| s.request == request)
            || self.links.iter().any(|s| s.request == request)
    }

    pub fn reserve(
        &mut self,
        topology: &mut Topology,
        slot: NodeSlot,
        size: u32,
    ) -> Result<(), InvariantViolation> {
        if self.nodes.contains_key(&slot) {
            return Err(InvariantViolation::DoubleReservation {
                request: slot.request,
                node: slot.node,
                function: slot.function,
            });
        }
        topology.reserve(slot.node, size)?;
        self.nodes.insert(slot, size);
        Ok(())
    }

    pub fn reserve_link(
        &mut self,
        topology: &mut Topology,
        slot: LinkSlot,
    ) -> Result<(), InvariantViolation> {
        if self.links.contains(&slot) {
            return Err(InvariantViolation::DoubleReservation {
                request: slot.request,
                node: slot.src,
                function: slot.pair,
            });
        }
        topology.consume(slot.src, slot.dst, 1)?;
        self.links.insert(slot);
        Ok(())
    }

    /// Release one node slot. Returns whether anything was held.
    pub fn release(
        &mut self,
        topology: &mut Topology,
        slot: &NodeSlot,
    ) -> Result<bool, InvariantViolation> {
        match self.nodes.remove(slot) {
            Some(size) => {
                topology.release(slot.node, size)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn release_link(
        &mut self,
        topology: &mut Topology,
        slot: &LinkSlot,
    ) -> Result<bool, InvariantViolation> {
        if self.links.remove(slot) {
            topology.restore(slot.src, slot.dst, 1)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Release everything `request` holds in any phase. Returns the number of
    /// slots freed.
    pub fn release_request(
        &mut self,
        topology: &mut Topology,
        request: RequestId,
    ) -> Result<usize, InvariantViolation> {
        self.release_except(topology, request, &BTreeSet::new(), &BTreeSet::new())
    }

    /// Release every slot of `request` except the `(node, function)` and
    /// `(pair, src, dst)` entries listed as kept.
    pub fn release_except(
        &mut self,
        topology: &mut Topology,
        request: RequestId,
        keep_nodes: &BTreeSet<(NodeId, FunctionId)>,
        keep_links: &BTreeSet<(u32, NodeId, NodeId)>,
    ) -> Result<usize, InvariantViolation> {
        let node_slots: Vec<NodeSlot> = self
            .nodes
            .keys()
            .filter(|s| s.request == request && !keep_nodes.contains(&(s.node, s.function)))
            .copied()
            .collect();
        let link_slots: Vec<LinkSlot> = self
            .links
            .iter()
            .filter(|s| s.request == request && !keep_links.contains(&(s.pair, s.src, s.dst)))
            .copied()
            .collect();
        let mut freed = 0;
        for slot in &node_slots {
            if self.release(topology, slot)? {
                freed += 1;
            }
        }
        for slot in &link_slots {
            if self.release_link(topology, slot)? {
                freed += 1;
            }
        }
        Ok(freed)
    }

    /// Capacity held on `node` across all slots.
    pub fn reserved_on(&self, node: NodeId) -> u32 {
        self.nodes
            .iter()
            .filter(|(s, _)| s.node == node)
            .map(|(_, size)| *size)
            .sum()
    }

    /// Bandwidth units held on `src -> dst`.
    pub fn reserved_link(&self, src: NodeId, dst: NodeId) -> u32 {
        self.links
            .iter()
            .filter(|s| s.src == src && s.dst == dst)
            .count() as u32
    }

    /// `(node, function)` pairs held by `request`.
    pub fn functions_of(&self, request: RequestId) -> BTreeSet<(NodeId, FunctionId)> {
        self.nodes
            .keys()
            .filter(|s| s.request == request)
            .map(|s| (s.node, s.function))
            .collect()
    }
}
