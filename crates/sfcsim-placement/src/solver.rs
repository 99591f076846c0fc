//! Binary integer programs and the solver binding.
//!
//! ```text
//!   MilpModel ──► MilpSolver::solve(model, budget) ──► Solution
//!                     │
//!                     └── BranchAndBound: propagation + optimistic bound,
//!                         priority branching, node/time budget
//! ```
//!
//! Budget exhaustion is not an error: the best incumbent is returned with its
//! relative gap, and a model with no incumbent at all reports gap 100.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

const EPS: f64 = 1e-9;

/// Gap reported when no feasible assignment is known.
pub const NO_SOLUTION_GAP: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub usize);

/// `Σ coef · var + constant`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearExpr {
    terms: Vec<(VarId, f64)>,
    constant: f64,
}

impl LinearExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(var: VarId) -> Self {
        Self::new().plus(var, 1.0)
    }

    pub fn plus(mut self, var: VarId, coef: f64) -> Self {
        self.add_term(var, coef);
        self
    }

    pub fn add_term(&mut self, var: VarId, coef: f64) {
        if coef != 0.0 {
            self.terms.push((var, coef));
        }
    }

    pub fn add_constant(&mut self, value: f64) {
        self.constant += value;
    }

    pub fn add_expr(&mut self, other: &LinearExpr, scale: f64) {
        for (var, coef) in &other.terms {
            self.add_term(*var, coef * scale);
        }
        self.constant += other.constant * scale;
    }

    pub fn terms(&self) -> &[(VarId, f64)] {
        &self.terms
    }

    pub fn constant(&self) -> f64 {
        self.constant
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn eval(&self, values: &[bool]) -> f64 {
        self.constant
            + self
                .terms
                .iter()
                .filter(|(v, _)| values[v.0])
                .map(|(_, c)| c)
                .sum::<f64>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sense {
    Le,
    Ge,
    Eq,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub expr: LinearExpr,
    pub sense: Sense,
    pub rhs: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    /// Higher priorities are branched on first.
    pub priority: f64,
    /// Value tried first while no incumbent exists.
    pub hint: bool,
}

/// A maximization problem over binary variables.
#[derive(Debug, Clone, Default)]
pub struct MilpModel {
    vars: Vec<Variable>,
    constraints: Vec<Constraint>,
    objective: LinearExpr,
}

impl MilpModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binary(&mut self, name: impl Into<String>) -> VarId {
        self.vars.push(Variable {
            name: name.into(),
            priority: 0.0,
            hint: false,
        });
        VarId(self.vars.len() - 1)
    }

    pub fn set_priority(&mut self, var: VarId, priority: f64) {
        self.vars[var.0].priority = priority;
    }

    pub fn set_hint(&mut self, var: VarId, hint: bool) {
        self.vars[var.0].hint = hint;
    }

    pub fn constrain(&mut self, name: impl Into<String>, expr: LinearExpr, sense: Sense, rhs: f64) {
        self.constraints.push(Constraint {
            name: name.into(),
            expr,
            sense,
            rhs,
        });
    }

    pub fn fix(&mut self, var: VarId, value: bool) {
        let name = format!("fix_{}", self.vars[var.0].name);
        self.constrain(name, LinearExpr::var(var), Sense::Eq, if value { 1.0 } else { 0.0 });
    }

    pub fn maximize(&mut self, objective: LinearExpr) {
        self.objective = objective;
    }

    pub fn vars(&self) -> &[Variable] {
        &self.vars
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn objective(&self) -> &LinearExpr {
        &self.objective
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveBudget {
    pub node_limit: u64,
    pub time_limit: Option<Duration>,
}

impl SolveBudget {
    pub fn nodes(node_limit: u64) -> Self {
        Self {
            node_limit,
            time_limit: None,
        }
    }

    /// The same budget with the node limit divided by `factor` (at least 1).
    pub fn scaled_down(&self, factor: u64) -> Self {
        Self {
            node_limit: (self.node_limit / factor.max(1)).max(1),
            time_limit: self.time_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Optimal,
    /// Budget exhausted with an incumbent.
    Feasible,
    Infeasible,
    /// Budget exhausted before any incumbent.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub status: SolveStatus,
    values: Vec<bool>,
    pub objective: f64,
    pub bound: f64,
    /// Relative optimality gap as a fraction; [`NO_SOLUTION_GAP`] without an incumbent.
    pub gap: f64,
    pub nodes: u64,
    pub elapsed: Duration,
}

impl Solution {
    pub fn has_incumbent(&self) -> bool {
        matches!(self.status, SolveStatus::Optimal | SolveStatus::Feasible)
    }

    pub fn value(&self, var: VarId) -> bool {
        self.values.get(var.0).copied().unwrap_or(false)
    }
}

/// A session with a MILP backend. One session serves one model.
pub trait MilpSolver {
    fn name(&self) -> &str;

    fn solve(&mut self, model: &MilpModel, budget: &SolveBudget) -> Solution;
}

/// Depth-first binary branch-and-bound with constraint propagation.
#[derive(Debug, Default)]
pub struct BranchAndBound;

impl BranchAndBound {
    pub fn new() -> Self {
        Self
    }
}

impl MilpSolver for BranchAndBound {
    fn name(&self) -> &str {
        "branch_and_bound"
    }

    fn solve(&mut self, model: &MilpModel, budget: &SolveBudget) -> Solution {
        let start = Instant::now();
        let mut search = Search::new(model);
        let (complete, nodes) = search.run(budget, start);
        let elapsed = start.elapsed();

        let solution = match search.incumbent.take() {
            Some((objective, values)) => {
                let bound = if complete {
                    objective
                } else {
                    search.open_bound.max(objective)
                };
                let gap = if complete {
                    0.0
                } else {
                    (bound - objective).abs() / (1e-10 + objective.abs())
                };
                Solution {
                    status: if complete {
                        SolveStatus::Optimal
                    } else {
                        SolveStatus::Feasible
                    },
                    values,
                    objective,
                    bound,
                    gap,
                    nodes,
                    elapsed,
                }
            }
            None => Solution {
                status: if complete {
                    SolveStatus::Infeasible
                } else {
                    SolveStatus::Unknown
                },
                values: vec![false; model.num_vars()],
                objective: 0.0,
                bound: search.open_bound,
                gap: NO_SOLUTION_GAP,
                nodes,
                elapsed,
            },
        };
        debug!(
            status = ?solution.status,
            nodes = solution.nodes,
            objective = solution.objective,
            gap = solution.gap,
            "branch and bound finished"
        );
        solution
    }
}

struct Frame {
    mark: usize,
    var: usize,
    order: [bool; 2],
    next: usize,
    bound: f64,
}

struct Search<'m> {
    model: &'m MilpModel,
    domains: Vec<Option<bool>>,
    trail: Vec<usize>,
    watches: Vec<Vec<usize>>,
    branch_order: Vec<usize>,
    incumbent: Option<(f64, Vec<bool>)>,
    /// Best bound over subtrees left unexplored when the budget ran out.
    open_bound: f64,
}

impl<'m> Search<'m> {
    fn new(model: &'m MilpModel) -> Self {
        let mut watches = vec![Vec::new(); model.num_vars()];
        for (i, c) in model.constraints.iter().enumerate() {
            for (var, _) in c.expr.terms() {
                watches[var.0].push(i);
            }
        }
        let mut branch_order: Vec<usize> = (0..model.num_vars()).collect();
        branch_order.sort_by(|a, b| {
            model.vars[*b]
                .priority
                .partial_cmp(&model.vars[*a].priority)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self {
            model,
            domains: vec![None; model.num_vars()],
            trail: Vec::new(),
            watches,
            branch_order,
            incumbent: None,
            open_bound: f64::NEG_INFINITY,
        }
    }

    /// Returns whether the tree was fully explored, and the node count.
    fn run(&mut self, budget: &SolveBudget, start: Instant) -> (bool, u64) {
        let all: Vec<usize> = (0..self.model.constraints.len()).collect();
        if !self.propagate(all) {
            return (true, 0);
        }
        let mut stack: Vec<Frame> = Vec::new();
        let mut nodes = 0u64;
        let mut fresh = true;
        loop {
            if fresh {
                nodes += 1;
                let out_of_nodes = nodes > budget.node_limit;
                let out_of_time = nodes % 64 == 0
                    && budget.time_limit.is_some_and(|limit| start.elapsed() >= limit);
                if out_of_nodes || out_of_time {
                    let current = self.bound();
                    let open = stack
                        .iter()
                        .filter(|f| f.next < 2)
                        .map(|f| f.bound)
                        .fold(current, f64::max);
                    self.open_bound = open;
                    return (false, nodes);
                }
                let bound = self.bound();
                let pruned = self
                    .incumbent
                    .as_ref()
                    .is_some_and(|(best, _)| bound <= *best + EPS);
                if !pruned {
                    match self.pick_branch() {
                        None => self.record_incumbent(),
                        Some(var) => {
                            let order = self.value_order(var);
                            stack.push(Frame {
                                mark: self.trail.len(),
                                var,
                                order,
                                next: 0,
                                bound,
                            });
                        }
                    }
                }
            }
            let Some(frame) = stack.last_mut() else {
                return (true, nodes);
            };
            let (mark, var) = (frame.mark, frame.var);
            if frame.next >= 2 {
                stack.pop();
                self.undo_to(mark);
                fresh = false;
                continue;
            }
            let value = frame.order[frame.next];
            frame.next += 1;
            self.undo_to(mark);
            fresh = self.assign(var, value);
        }
    }

    fn value_order(&self, var: usize) -> [bool; 2] {
        let first = if self.incumbent.is_none() {
            self.model.vars[var].hint
        } else {
            let coef: f64 = self
                .model
                .objective
                .terms()
                .iter()
                .filter(|(v, _)| v.0 == var)
                .map(|(_, c)| c)
                .sum();
            if coef > 0.0 {
                true
            } else if coef < 0.0 {
                false
            } else {
                self.model.vars[var].hint
            }
        };
        [first, !first]
    }

    fn pick_branch(&self) -> Option<usize> {
        self.branch_order
            .iter()
            .copied()
            .find(|v| self.domains[*v].is_none())
    }

    fn record_incumbent(&mut self) {
        let values: Vec<bool> = self.domains.iter().map(|d| d.unwrap_or(false)).collect();
        let objective = self.model.objective.eval(&values);
        let better = self
            .incumbent
            .as_ref()
            .map_or(true, |(best, _)| objective > *best + EPS);
        if better {
            self.incumbent = Some((objective, values));
        }
    }

    /// Objective value assuming every free variable takes its best value.
    fn bound(&self) -> f64 {
        let mut total = self.model.objective.constant();
        for (var, coef) in self.model.objective.terms() {
            total += match self.domains[var.0] {
                Some(true) => *coef,
                Some(false) => 0.0,
                None => coef.max(0.0),
            };
        }
        total
    }

    fn undo_to(&mut self, mark: usize) {
        while self.trail.len() > mark {
            if let Some(var) = self.trail.pop() {
                self.domains[var] = None;
            }
        }
    }

    fn assign(&mut self, var: usize, value: bool) -> bool {
        match self.domains[var] {
            Some(current) => current == value,
            None => {
                self.domains[var] = Some(value);
                self.trail.push(var);
                let queue = self.watches[var].clone();
                self.propagate(queue)
            }
        }
    }

    /// Run bound propagation to a fixpoint. Returns `false` on conflict.
    fn propagate(&mut self, mut queue: Vec<usize>) -> bool {
        while let Some(ci) = queue.pop() {
            let constraint = &self.model.constraints[ci];
            let mut min = constraint.expr.constant();
            let mut max = constraint.expr.constant();
            for (var, coef) in constraint.expr.terms() {
                match self.domains[var.0] {
                    Some(true) => {
                        min += coef;
                        max += coef;
                    }
                    Some(false) => {}
                    None => {
                        min += coef.min(0.0);
                        max += coef.max(0.0);
                    }
                }
            }
            let (upper, lower) = match constraint.sense {
                Sense::Le => (Some(constraint.rhs), None),
                Sense::Ge => (None, Some(constraint.rhs)),
                Sense::Eq => (Some(constraint.rhs), Some(constraint.rhs)),
            };
            if upper.is_some_and(|u| min > u + EPS) || lower.is_some_and(|l| max < l - EPS) {
                return false;
            }
            let mut forced = Vec::new();
            for (var, coef) in constraint.expr.terms() {
                if self.domains[var.0].is_some() {
                    continue;
                }
                let span = coef.abs();
                if let Some(u) = upper {
                    // Taking the costly value would push the minimum past the bound.
                    if min + span > u + EPS {
                        forced.push((var.0, *coef < 0.0));
                        continue;
                    }
                }
                if let Some(l) = lower {
                    if max - span < l - EPS {
                        forced.push((var.0, *coef > 0.0));
                    }
                }
            }
            for (var, value) in forced {
                match self.domains[var] {
                    Some(current) if current != value => return false,
                    Some(_) => {}
                    None => {
                        self.domains[var] = Some(value);
                        self.trail.push(var);
                        queue.extend(self.watches[var].iter().copied());
                    }
                }
            }
        }
        true
    }
}
