//! Compute nodes and the links between them.
//!
//! Nodes and links are stored in flat tables indexed by [`NodeId`]. All
//! capacity and bandwidth mutation goes through checked operations that keep
//! `0 <= capacity <= original_capacity` and `0 <= bandwidth <= original_bandwidth`,
//! returning an [`InvariantViolation`] instead of silently clamping.

use crate::demand::{FunctionId, RequestId};
use crate::error::{InputError, InvariantViolation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dense node index, `0..topology.len()`.
pub type NodeId = usize;

/// Ordered `(src, dst)` pair identifying a directed link.
pub type LinkKey = (NodeId, NodeId);

/// Static description of a node, as read from input or synthesized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub x: i64,
    pub y: i64,
    pub capacity: u32,
    pub processing_rate: u32,
    pub state_cost: u32,
}

/// A capacity-bounded placement target.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub x: i64,
    pub y: i64,
    /// Per-unit processing delay: a function of size `s` costs `processing_rate * s`.
    pub processing_rate: u32,
    capacity: u32,
    original_capacity: u32,
    /// Best-effort allocations activated at use time.
    dynamic_size: u32,
    state_cost: u32,
    /// Nodes within coordinate range, including this node.
    neighbors: Vec<NodeId>,
    /// Whether the runtime state of `(request, function)` is already resident here.
    existing_state: BTreeMap<(RequestId, FunctionId), bool>,
}

impl Node {
    pub fn new(spec: &NodeSpec) -> Self {
        Self {
            id: spec.id,
            x: spec.x,
            y: spec.y,
            processing_rate: spec.processing_rate,
            capacity: spec.capacity,
            original_capacity: spec.capacity,
            dynamic_size: 0,
            state_cost: spec.state_cost,
            neighbors: Vec::new(),
            existing_state: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn original_capacity(&self) -> u32 {
        self.original_capacity
    }

    pub fn dynamic_size(&self) -> u32 {
        self.dynamic_size
    }

    pub fn state_cost(&self) -> u32 {
        self.state_cost
    }

    pub fn set_state_cost(&mut self, cost: u32) {
        self.state_cost = cost;
    }

    pub fn neighbors(&self) -> &[NodeId] {
        &self.neighbors
    }

    /// Capacity currently held by reservations and dynamic activations.
    pub fn used(&self) -> u32 {
        self.original_capacity - self.capacity
    }

    pub fn has_room(&self, size: u32) -> bool {
        self.capacity >= size
    }

    /// Processing delay of a function of `size` on this node.
    pub fn proc_delay(&self, size: u32) -> u32 {
        self.processing_rate * size
    }

    pub fn reserve(&mut self, size: u32) -> Result<(), InvariantViolation> {
        if size > self.capacity {
            return Err(InvariantViolation::NegativeCapacity {
                node: self.id,
                capacity: self.capacity,
                size,
            });
        }
        self.capacity -= size;
        Ok(())
    }

    pub fn release(&mut self, size: u32) -> Result<(), InvariantViolation> {
        if self.capacity + size > self.original_capacity {
            return Err(InvariantViolation::CapacityAboveOriginal {
                node: self.id,
                capacity: self.capacity,
                size,
                original: self.original_capacity,
            });
        }
        self.capacity += size;
        Ok(())
    }

    /// Activate a best-effort allocation. Requires strictly more spare
    /// capacity than `size`; returns `false` when the node is too full.
    pub fn activate_dynamic(&mut self, size: u32) -> Result<bool, InvariantViolation> {
        if self.capacity <= size {
            return Ok(false);
        }
        self.reserve(size)?;
        self.dynamic_size += size;
        Ok(true)
    }

    pub fn deactivate_dynamic(&mut self, size: u32) -> Result<(), InvariantViolation> {
        if size > self.dynamic_size {
            return Err(InvariantViolation::DynamicUnderflow {
                node: self.id,
                dynamic: self.dynamic_size,
                size,
            });
        }
        self.release(size)?;
        self.dynamic_size -= size;
        Ok(())
    }

    /// Reset both current and original capacity, dropping any reservation.
    pub fn rebase_capacity(&mut self, capacity: u32) {
        self.capacity = capacity;
        self.original_capacity = capacity;
        self.dynamic_size = 0;
    }

    /// Register `(request, function)` so its residency is tracked from now on.
    pub fn track_state(&mut self, request: RequestId, function: FunctionId) {
        self.existing_state.entry((request, function)).or_insert(false);
    }

    pub fn set_resident(&mut self, request: RequestId, function: FunctionId, resident: bool) {
        self.existing_state.insert((request, function), resident);
    }

    pub fn is_resident(&self, request: RequestId, function: FunctionId) -> bool {
        self.existing_state
            .get(&(request, function))
            .copied()
            .unwrap_or(false)
    }

    /// Migration cost of starting `function` for `request` here: zero when the
    /// state is already resident.
    pub fn launch_cost(&self, request: RequestId, function: FunctionId) -> u32 {
        if self.is_resident(request, function) {
            0
        } else {
            self.state_cost
        }
    }

    pub fn forget_request(&mut self, request: RequestId) {
        self.existing_state.retain(|(r, _), _| *r != request);
    }
}

/// A directed link. Out-of-range links keep `bandwidth = delay = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub src: NodeId,
    pub dst: NodeId,
    pub delay: u32,
    bandwidth: u32,
    original_bandwidth: u32,
}

impl Link {
    pub fn new(src: NodeId, dst: NodeId, delay: u32, bandwidth: u32) -> Self {
        Self {
            src,
            dst,
            delay,
            bandwidth,
            original_bandwidth: bandwidth,
        }
    }

    pub fn key(&self) -> LinkKey {
        (self.src, self.dst)
    }

    pub fn bandwidth(&self) -> u32 {
        self.bandwidth
    }

    pub fn original_bandwidth(&self) -> u32 {
        self.original_bandwidth
    }

    /// A link can carry traffic only while it has bandwidth left.
    pub fn is_usable(&self) -> bool {
        self.bandwidth > 0
    }

    pub fn consume(&mut self, units: u32) -> Result<(), InvariantViolation> {
        if units > self.bandwidth {
            return Err(self.out_of_bounds(units, "-"));
        }
        self.bandwidth -= units;
        Ok(())
    }

    pub fn restore(&mut self, units: u32) -> Result<(), InvariantViolation> {
        if self.bandwidth + units > self.original_bandwidth {
            return Err(self.out_of_bounds(units, "+"));
        }
        self.bandwidth += units;
        Ok(())
    }

    fn out_of_bounds(&self, units: u32, op: &'static str) -> InvariantViolation {
        InvariantViolation::BandwidthOutOfBounds {
            src: self.src,
            dst: self.dst,
            bandwidth: self.bandwidth,
            units,
            original: self.original_bandwidth,
            op,
        }
    }
}

/// Nodes plus a dense `n x n` link table.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<Node>,
    links: Vec<Option<Link>>,
    allowed_range: i64,
}

impl Topology {
    /// Build a topology from explicit links. Neighbourhoods are derived from
    /// node coordinates and `allowed_range`.
    pub fn new(
        specs: &[NodeSpec],
        links: Vec<Link>,
        allowed_range: i64,
    ) -> Result<Self, InputError> {
        let n = specs.len();
        for (i, spec) in specs.iter().enumerate() {
            if spec.id != i {
                return Err(InputError::UnknownNode { node: spec.id, nodes: n });
            }
        }
        let mut table = vec![None; n * n];
        for link in links {
            if link.src >= n || link.dst >= n {
                return Err(InputError::UnknownNode {
                    node: link.src.max(link.dst),
                    nodes: n,
                });
            }
            if link.src != link.dst {
                let idx = link.src * n + link.dst;
                table[idx] = Some(link);
            }
        }
        let mut topology = Self {
            nodes: specs.iter().map(Node::new).collect(),
            links: table,
            allowed_range,
        };
        topology.compute_neighbors();
        Ok(topology)
    }

    /// Create a link for every ordered pair of distinct nodes, with `delay` and
    /// `bandwidth` inside the coordinate range and zero outside it.
    pub fn ranged(
        specs: &[NodeSpec],
        allowed_range: i64,
        delay: u32,
        bandwidth: u32,
    ) -> Result<Self, InputError> {
        let mut links = Vec::with_capacity(specs.len() * specs.len());
        for a in specs {
            for b in specs {
                if a.id == b.id {
                    continue;
                }
                if coords_in_range(a.x, a.y, b.x, b.y, allowed_range) {
                    links.push(Link::new(a.id, b.id, delay, bandwidth));
                } else {
                    links.push(Link::new(a.id, b.id, 0, 0));
                }
            }
        }
        Self::new(specs, links, allowed_range)
    }

    fn compute_neighbors(&mut self) {
        let coords: Vec<(i64, i64)> = self.nodes.iter().map(|n| (n.x, n.y)).collect();
        for node in &mut self.nodes {
            node.neighbors = coords
                .iter()
                .enumerate()
                .filter(|(_, (x, y))| coords_in_range(node.x, node.y, *x, *y, self.allowed_range))
                .map(|(j, _)| j)
                .collect();
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn allowed_range(&self) -> i64 {
        self.allowed_range
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn neighbors(&self, id: NodeId) -> &[NodeId] {
        self.nodes[id].neighbors()
    }

    pub fn link(&self, src: NodeId, dst: NodeId) -> Option<&Link> {
        let n = self.nodes.len();
        if src >= n || dst >= n {
            return None;
        }
        self.links[src * n + dst].as_ref()
    }

    fn link_mut(&mut self, src: NodeId, dst: NodeId) -> Result<&mut Link, InvariantViolation> {
        let n = self.nodes.len();
        if src >= n || dst >= n {
            return Err(InvariantViolation::MissingLink { src, dst });
        }
        self.links[src * n + dst]
            .as_mut()
            .ok_or(InvariantViolation::MissingLink { src, dst })
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter().flatten()
    }

    /// Whether two nodes lie within the coordinate range of each other.
    pub fn in_range(&self, a: NodeId, b: NodeId) -> bool {
        let (na, nb) = (&self.nodes[a], &self.nodes[b]);
        coords_in_range(na.x, na.y, nb.x, nb.y, self.allowed_range)
    }

    /// Delay of the hop `a -> b`; zero for the same node or an absent link.
    pub fn delay(&self, a: NodeId, b: NodeId) -> u32 {
        if a == b || !self.in_range(a, b) {
            return 0;
        }
        self.link(a, b).map(|l| l.delay).unwrap_or(0)
    }

    /// Whether `a -> b` currently has bandwidth to carry a chain hop.
    pub fn has_bandwidth(&self, a: NodeId, b: NodeId) -> bool {
        self.link(a, b).is_some_and(Link::is_usable)
    }

    pub fn proc_delay(&self, node: NodeId, size: u32) -> u32 {
        self.nodes[node].proc_delay(size)
    }

    pub fn reserve(&mut self, node: NodeId, size: u32) -> Result<(), InvariantViolation> {
        self.nodes[node].reserve(size)
    }

    pub fn release(&mut self, node: NodeId, size: u32) -> Result<(), InvariantViolation> {
        self.nodes[node].release(size)
    }

    pub fn consume(&mut self, src: NodeId, dst: NodeId, units: u32) -> Result<(), InvariantViolation> {
        self.link_mut(src, dst)?.consume(units)
    }

    pub fn restore(&mut self, src: NodeId, dst: NodeId, units: u32) -> Result<(), InvariantViolation> {
        self.link_mut(src, dst)?.restore(units)
    }

    /// Copy migration-state bookkeeping (residency and state costs) from the
    /// topology of a previous interval, keeping this topology's capacities.
    pub fn carry_state_from(&mut self, previous: &Topology) {
        for (node, prev) in self.nodes.iter_mut().zip(previous.nodes.iter()) {
            node.existing_state = prev.existing_state.clone();
            node.state_cost = prev.state_cost;
        }
    }

    /// Set every node's capacity (current and original) to `capacity`.
    pub fn rebase_capacities(&mut self, capacity: u32) {
        for node in &mut self.nodes {
            node.rebase_capacity(capacity);
        }
    }

    pub fn forget_request(&mut self, request: RequestId) {
        for node in &mut self.nodes {
            node.forget_request(request);
        }
    }

    pub fn specs(&self) -> Vec<NodeSpec> {
        self.nodes
            .iter()
            .map(|n| NodeSpec {
                id: n.id,
                x: n.x,
                y: n.y,
                capacity: n.original_capacity,
                processing_rate: n.processing_rate,
                state_cost: n.state_cost,
            })
            .collect()
    }
}

fn coords_in_range(x1: i64, y1: i64, x2: i64, y2: i64, range: i64) -> bool {
    (x1 - x2).abs() <= range && (y1 - y2).abs() <= range
}
