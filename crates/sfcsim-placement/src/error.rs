//! Error taxonomy shared by both placement strategies.
//!
//! Invariant violations and input malformation are fatal and kept in separate
//! enums so callers cannot mistake one for the other. Infeasibility is never an
//! error: strategies report it as data (`Ok(None)`, or a solution that accepts
//! nothing).

use crate::demand::{AppId, FunctionId, RequestId};
use crate::topology::NodeId;
use thiserror::Error;

/// A resource accounting rule was broken. Always indicates a logic defect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("node {node}: reserving {size} exceeds remaining capacity {capacity}")]
    NegativeCapacity { node: NodeId, capacity: u32, size: u32 },
    #[error("node {node}: releasing {size} lifts capacity {capacity} above original {original}")]
    CapacityAboveOriginal {
        node: NodeId,
        capacity: u32,
        size: u32,
        original: u32,
    },
    #[error("link {src}->{dst}: bandwidth {bandwidth} {op} {units} leaves [0, {original}]")]
    BandwidthOutOfBounds {
        src: NodeId,
        dst: NodeId,
        bandwidth: u32,
        units: u32,
        original: u32,
        op: &'static str,
    },
    #[error("node {node}: dynamic allocation {dynamic} cannot release {size}")]
    DynamicUnderflow { node: NodeId, dynamic: u32, size: u32 },
    #[error("link {src}->{dst} does not exist")]
    MissingLink { src: NodeId, dst: NodeId },
    #[error("slot (request {request}, node {node}, function {function}) is already reserved")]
    DoubleReservation {
        request: RequestId,
        node: NodeId,
        function: FunctionId,
    },
    #[error("request {request} expected a reservation that is absent: {detail}")]
    MissingReservation { request: RequestId, detail: String },
    #[error("duplicate fan-out instance for request {request} at node {node}")]
    DuplicateInstance { request: RequestId, node: NodeId },
    #[error("admission limit dropped below zero ({limit})")]
    NegativeLimit { limit: i64 },
}

/// Malformed topology, chain or probability input. Fatal at load time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("app {app} references unknown function {function}")]
    UnknownFunction { app: AppId, function: FunctionId },
    #[error("request {request} references unknown app {app}")]
    UnknownApp { request: RequestId, app: AppId },
    #[error("app {app}: pair ids must be contiguous from 1, got {ids:?}")]
    NonContiguousPairs { app: AppId, ids: Vec<u32> },
    #[error("app {app}: pair ({from},{to}) appears twice")]
    DuplicatePair {
        app: AppId,
        from: FunctionId,
        to: FunctionId,
    },
    #[error("app {app}: pair {pair} does not continue the chain with a new function")]
    BrokenChain { app: AppId, pair: u32 },
    #[error("app {app}: a chain needs at least two functions")]
    ChainTooShort { app: AppId },
    #[error("node {node} is outside the topology of {nodes} nodes")]
    UnknownNode { node: NodeId, nodes: usize },
    #[error("probability row {row} has {got} entries, expected {expected}")]
    ProbabilityRowMismatch {
        row: usize,
        got: usize,
        expected: usize,
    },
    #[error("probability {value} at row {row} exceeds 1")]
    ProbabilityAboveOne { row: usize, value: f64 },
    #[error("request {request} has zero total weight")]
    ZeroTotalWeight { request: RequestId },
}

/// Fatal outcome of a placement call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error(transparent)]
    Input(#[from] InputError),
}
