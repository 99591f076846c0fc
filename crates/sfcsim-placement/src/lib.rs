//! Service function chain placement for sfcsim.
//!
//! This crate holds the shared resource model and the two strategies that
//! place chains onto it:
//!
//! | Strategy | Module | Output |
//! |----------|--------|--------|
//! | Coverage heuristic | [`coverage`] | [`RequestPlacement`] per request, realized by [`replay()`] |
//! | Exact formulation | [`formulation`] | [`ExactOutcome`] from a [`MilpSolver`] session |
//!
//! Both strategies mutate a [`Topology`] only through reservation
//! operations, so capacity and bandwidth stay within their original bounds.

pub mod coverage;
pub mod demand;
pub mod error;
pub mod formulation;
pub mod placement;
pub mod replay;
pub mod reservation;
pub mod solver;
pub mod topology;

pub use coverage::CoverageHeuristic;
pub use demand::{App, AppId, Catalog, Function, FunctionId, PairRow, Request, RequestId, Segment, USER};
pub use error::{InputError, InvariantViolation, PlacementError};
pub use formulation::{ExactFormulation, ExactModel, ExactOutcome, FormulationOptions, ModelKind, ObjectiveMode};
pub use placement::{ChainAssignment, RequestPlacement, VnfPlace};
pub use replay::{replay, ReplayOutcome};
pub use reservation::{LinkSlot, NodeSlot, Phase, ReservationLedger, ReservationTxn, TxnEntry};
pub use solver::{
    BranchAndBound, LinearExpr, MilpModel, MilpSolver, Sense, Solution, SolveBudget, SolveStatus,
    VarId, NO_SOLUTION_GAP,
};
pub use topology::{Link, LinkKey, Node, NodeId, NodeSpec, Topology};

/// Open a solver session by name.
pub fn solver_by_name(name: &str) -> Option<Box<dyn MilpSolver + Send>> {
    match name {
        "branch_and_bound" => Some(Box::new(BranchAndBound::new())),
        _ => None,
    }
}

/// List all available solver backends.
pub fn available_solvers() -> Vec<&'static str> {
    vec!["branch_and_bound"]
}
