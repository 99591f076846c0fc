//! Exact chain placement as a binary program.
//!
//! | Variable | Indexed by | Meaning |
//! |---|---|---|
//! | `delta` | (request, node, function) | function placed for the logical request |
//! | `dd` | (instance, node, function) | function serves one fan-out instance |
//! | `y` | (request, pair, link) | pair traffic of the logical request crosses the link |
//! | `yy` | (instance, pair, link) | pair traffic of one instance crosses the link |
//! | `s` | (instance, pair) | pair placed within its latency budget |
//! | `st` | instance | whole chain satisfied |
//!
//! An instance is one `(request, location)` of a fanned-out prediction. All
//! instances of a request share `delta` and `y`, so capacity and bandwidth
//! are charged once per logical request. A `dd` entry whose node is out of
//! range of the instance location, or whose user hop has no bandwidth, is a
//! constant zero and never becomes a variable.

use crate::demand::{App, Catalog, FunctionId, Request, RequestId, USER};
use crate::error::{InputError, InvariantViolation, PlacementError};
use crate::solver::{
    LinearExpr, MilpModel, MilpSolver, Sense, Solution, SolveBudget, SolveStatus, VarId,
};
use crate::topology::{NodeId, Topology};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

/// How latency enters the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveMode {
    /// Every pair is checked against its own budget.
    #[default]
    Pairwise,
    /// The chain total is checked against the summed budgets.
    EndToEnd,
}

/// Which phase a model is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Estimated demand; the acceptance threshold applies.
    Preallocate,
    /// Realized demand.
    Adjust,
}

impl ModelKind {
    pub fn is_estimated(&self) -> bool {
        matches!(self, ModelKind::Preallocate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormulationOptions {
    pub objective: ObjectiveMode,
    /// Host every function at the instance's own location. The coverage
    /// heuristic does not honour this.
    pub place_at_user_location: bool,
    /// Co-locate all functions of a chain. Not honoured by the heuristic.
    pub non_split: bool,
    /// Minimum probability mass a fanned-out request must have accepted.
    pub acceptance_threshold: f64,
}

impl Default for FormulationOptions {
    fn default() -> Self {
        Self {
            objective: ObjectiveMode::Pairwise,
            place_at_user_location: false,
            non_split: false,
            acceptance_threshold: 0.0,
        }
    }
}

type InstanceLink = (usize, u32, NodeId, NodeId);
type RequestLink = (RequestId, u32, NodeId, NodeId);

/// Variable tables of a built model.
#[derive(Debug, Default)]
struct ModelIndex {
    instances: Vec<(RequestId, NodeId)>,
    delta: BTreeMap<(RequestId, NodeId, FunctionId), VarId>,
    dd: BTreeMap<(usize, NodeId, FunctionId), VarId>,
    y: BTreeMap<RequestLink, VarId>,
    yy: BTreeMap<InstanceLink, VarId>,
    st: Vec<VarId>,
}

/// A built model and the tables needed to read its solution back.
#[derive(Debug)]
pub struct ExactModel {
    pub kind: ModelKind,
    pub model: MilpModel,
    index: ModelIndex,
}

impl ExactModel {
    pub fn instance_count(&self) -> usize {
        self.index.instances.len()
    }

    /// Read a solver result back into placement terms.
    pub fn extract(&self, solution: &Solution) -> ExactOutcome {
        let mut outcome = ExactOutcome {
            kind: self.kind,
            status: solution.status,
            gap: solution.gap,
            objective: solution.objective,
            nodes: solution.nodes,
            elapsed: solution.elapsed,
            ..ExactOutcome::empty(self.kind)
        };
        if !solution.has_incumbent() {
            return outcome;
        }
        let idx = &self.index;
        for (i, st) in idx.st.iter().enumerate() {
            if solution.value(*st) {
                outcome.accepted.insert(idx.instances[i]);
            }
        }
        for (key, var) in &idx.delta {
            if solution.value(*var) {
                outcome.assignment.insert(*key);
            }
        }
        for ((i, d, f), var) in &idx.dd {
            if solution.value(*var) {
                let (r, loc) = idx.instances[*i];
                outcome.instance_assignment.insert((r, loc, *d, *f));
            }
        }
        for (key, var) in &idx.y {
            if solution.value(*var) {
                outcome.link_usage.insert(*key);
            }
        }
        for ((i, p, a, b), var) in &idx.yy {
            if solution.value(*var) {
                let (r, loc) = idx.instances[*i];
                outcome.instance_link_usage.insert((r, loc, *p, *a, *b));
            }
        }
        outcome
    }
}

/// Solved placement. Sets hold the entries whose indicator is one.
#[derive(Debug, Clone, PartialEq)]
pub struct ExactOutcome {
    pub kind: ModelKind,
    pub status: SolveStatus,
    pub gap: f64,
    pub objective: f64,
    pub nodes: u64,
    pub elapsed: Duration,
    /// Satisfied `(request, location)` instances.
    pub accepted: BTreeSet<(RequestId, NodeId)>,
    /// `(request, node, function)` placements of logical requests.
    pub assignment: BTreeSet<(RequestId, NodeId, FunctionId)>,
    /// `(request, location, node, function)` placements used by instances.
    pub instance_assignment: BTreeSet<(RequestId, NodeId, NodeId, FunctionId)>,
    /// `(request, pair, src, dst)` link usage of logical requests.
    pub link_usage: BTreeSet<(RequestId, u32, NodeId, NodeId)>,
    /// `(request, location, pair, src, dst)` link usage of instances.
    pub instance_link_usage: BTreeSet<(RequestId, NodeId, u32, NodeId, NodeId)>,
}

impl ExactOutcome {
    pub fn empty(kind: ModelKind) -> Self {
        Self {
            kind,
            status: SolveStatus::Optimal,
            gap: 0.0,
            objective: 0.0,
            nodes: 0,
            elapsed: Duration::ZERO,
            accepted: BTreeSet::new(),
            assignment: BTreeSet::new(),
            instance_assignment: BTreeSet::new(),
            link_usage: BTreeSet::new(),
            instance_link_usage: BTreeSet::new(),
        }
    }

    pub fn is_accepted(&self, request: RequestId, location: NodeId) -> bool {
        self.accepted.contains(&(request, location))
    }

    /// Logical requests with at least one satisfied instance.
    pub fn placed(&self) -> BTreeSet<RequestId> {
        self.accepted.iter().map(|(r, _)| *r).collect()
    }

    /// Locations at which `request` was accepted.
    pub fn accepted_locations(&self, request: RequestId) -> Vec<NodeId> {
        self.accepted
            .iter()
            .filter(|(r, _)| *r == request)
            .map(|(_, loc)| *loc)
            .collect()
    }

    pub fn functions_of(&self, request: RequestId) -> BTreeSet<(NodeId, FunctionId)> {
        self.assignment
            .iter()
            .filter(|(r, _, _)| *r == request)
            .map(|(_, d, f)| (*d, *f))
            .collect()
    }

    pub fn links_of(&self, request: RequestId) -> BTreeSet<(u32, NodeId, NodeId)> {
        self.link_usage
            .iter()
            .filter(|(r, _, _, _)| *r == request)
            .map(|(_, p, a, b)| (*p, *a, *b))
            .collect()
    }

    /// `(node, function)` pairs the instance at `location` relies on.
    pub fn instance_functions(
        &self,
        request: RequestId,
        location: NodeId,
    ) -> BTreeSet<(NodeId, FunctionId)> {
        self.instance_assignment
            .iter()
            .filter(|(r, loc, _, _)| *r == request && *loc == location)
            .map(|(_, _, d, f)| (*d, *f))
            .collect()
    }

    /// `(pair, src, dst)` hops the instance at `location` relies on.
    pub fn instance_links(
        &self,
        request: RequestId,
        location: NodeId,
    ) -> BTreeSet<(u32, NodeId, NodeId)> {
        self.instance_link_usage
            .iter()
            .filter(|(r, loc, _, _, _)| *r == request && *loc == location)
            .map(|(_, _, p, a, b)| (*p, *a, *b))
            .collect()
    }

    /// Node a function of `request` runs on for the instance at `location`.
    pub fn node_of(&self, request: RequestId, location: NodeId, function: FunctionId) -> Option<NodeId> {
        self.instance_assignment
            .iter()
            .find(|(r, loc, _, f)| *r == request && *loc == location && *f == function)
            .map(|(_, _, d, _)| *d)
    }
}

/// Builds and solves the exact model over a topology snapshot.
pub struct ExactFormulation<'a> {
    topology: &'a Topology,
    catalog: &'a Catalog,
    options: FormulationOptions,
}

impl<'a> ExactFormulation<'a> {
    pub fn new(topology: &'a Topology, catalog: &'a Catalog, options: FormulationOptions) -> Self {
        Self {
            topology,
            catalog,
            options,
        }
    }

    /// Build, solve within `budget`, and read the result back.
    pub fn solve<S>(
        &self,
        requests: &[Request],
        kind: ModelKind,
        solver: &mut S,
        budget: &SolveBudget,
    ) -> Result<ExactOutcome, PlacementError>
    where
        S: MilpSolver + ?Sized,
    {
        if requests.is_empty() {
            return Ok(ExactOutcome::empty(kind));
        }
        let model = self.build(requests, kind)?;
        let solution = solver.solve(&model.model, budget);
        let outcome = model.extract(&solution);
        info!(
            kind = ?kind,
            solver = solver.name(),
            instances = model.instance_count(),
            vars = model.model.num_vars(),
            accepted = outcome.accepted.len(),
            gap = outcome.gap,
            "exact model solved"
        );
        Ok(outcome)
    }

    pub fn build(&self, requests: &[Request], kind: ModelKind) -> Result<ExactModel, PlacementError> {
        let mut builder = Builder::new(self.topology, self.options);
        let mut apps: Vec<&App> = Vec::with_capacity(requests.len());
        let mut seen = BTreeSet::new();
        for request in requests {
            if request.location >= self.topology.len() {
                return Err(InputError::UnknownNode {
                    node: request.location,
                    nodes: self.topology.len(),
                }
                .into());
            }
            if !seen.insert(request.instance_key()) {
                return Err(InvariantViolation::DuplicateInstance {
                    request: request.id,
                    node: request.location,
                }
                .into());
            }
            let app = self.catalog.app(request.app).ok_or(InputError::UnknownApp {
                request: request.id,
                app: request.app,
            })?;
            apps.push(app);
            builder.index.instances.push(request.instance_key());
        }

        for (i, request) in requests.iter().enumerate() {
            builder.instance_functions(i, request, apps[i]);
        }
        for (i, request) in requests.iter().enumerate() {
            builder.instance_links(i, request, apps[i]);
        }
        builder.link_logical_requests(requests, &apps);
        builder.resource_limits(self.catalog);
        if self.options.place_at_user_location {
            builder.pin_to_user_location(requests);
        }
        if self.options.non_split {
            builder.forbid_split(requests, &apps);
        }

        let mut objective = LinearExpr::new();
        let mut charged = BTreeSet::new();
        for (i, request) in requests.iter().enumerate() {
            let st = builder.chain_satisfaction(i, request, apps[i], self.catalog);
            objective.add_term(st, request.weight * request.revenue as f64);
            if charged.insert(request.id) {
                let cost = builder.state_cost(request.id, apps[i]);
                objective.add_expr(&cost, -1.0);
            }
        }
        if kind.is_estimated() {
            builder.acceptance_threshold(requests, self.options.acceptance_threshold)?;
        }
        builder.model.maximize(objective);
        debug!(
            instances = requests.len(),
            vars = builder.model.num_vars(),
            constraints = builder.model.constraints().len(),
            "exact model built"
        );
        Ok(ExactModel {
            kind,
            model: builder.model,
            index: builder.index,
        })
    }
}

struct Builder<'t> {
    topology: &'t Topology,
    options: FormulationOptions,
    model: MilpModel,
    index: ModelIndex,
}

impl<'t> Builder<'t> {
    fn new(topology: &'t Topology, options: FormulationOptions) -> Self {
        Self {
            topology,
            options,
            model: MilpModel::new(),
            index: ModelIndex::default(),
        }
    }

    fn bandwidth(&self, a: NodeId, b: NodeId) -> u32 {
        self.topology.link(a, b).map(|l| l.bandwidth()).unwrap_or(0)
    }

    fn blocked(&self, a: NodeId, b: NodeId) -> bool {
        self.options.place_at_user_location || self.bandwidth(a, b) == 0
    }

    fn dd(&self, i: usize, d: NodeId, f: FunctionId) -> Option<VarId> {
        self.index.dd.get(&(i, d, f)).copied()
    }

    /// Create the valid `dd` entries of instance `i`.
    fn instance_functions(&mut self, i: usize, request: &Request, app: &App) {
        let n = self.topology.len();
        let loc = request.location;
        let mut invalid: BTreeSet<(NodeId, FunctionId)> = BTreeSet::new();
        for d in 0..n {
            if d != loc && self.blocked(loc, d) {
                invalid.insert((d, app.first()));
            }
            if d != loc && self.blocked(d, loc) {
                invalid.insert((d, app.last()));
            }
        }
        for d in 0..n {
            if !self.topology.in_range(d, loc) {
                continue;
            }
            for f in app.functions() {
                if invalid.contains(&(d, *f)) {
                    continue;
                }
                let var = self
                    .model
                    .add_binary(format!("dd_{}_{}_{}_{}", request.id, loc, d, f));
                self.index.dd.insert((i, d, *f), var);
            }
        }
    }

    fn y_var(&mut self, key: RequestLink) -> VarId {
        if let Some(var) = self.index.y.get(&key) {
            return *var;
        }
        let (r, p, a, b) = key;
        let var = self.model.add_binary(format!("y_{r}_{p}_{a}_{b}"));
        self.index.y.insert(key, var);
        var
    }

    fn yy_var(&mut self, i: usize, p: u32, a: NodeId, b: NodeId) -> VarId {
        let (r, loc) = self.index.instances[i];
        let var = self.model.add_binary(format!("yy_{r}_{loc}_{p}_{a}_{b}"));
        self.index.yy.insert((i, p, a, b), var);
        if !self.topology.in_range(a, b) {
            self.model.fix(var, false);
        }
        var
    }

    /// Traffic indicators of instance `i` for every pair and link.
    fn instance_links(&mut self, i: usize, request: &Request, app: &App) {
        let n = self.topology.len();
        let loc = request.location;
        for (p, segment) in app.segments().iter().enumerate() {
            let p = p as u32;
            for a in 0..n {
                for b in 0..n {
                    if a == b {
                        continue;
                    }
                    let from = self.dd(i, a, segment.from);
                    let to = self.dd(i, b, segment.to);
                    if self.blocked(a, b) {
                        if let (Some(d1), Some(d2)) = (from, to) {
                            self.model.constrain(
                                format!("nolink_{}_{}_{}_{}_{}", request.id, loc, p, a, b),
                                LinearExpr::var(d1).plus(d2, 1.0),
                                Sense::Le,
                                1.0,
                            );
                        }
                        continue;
                    }
                    if segment.from == USER || segment.to == USER {
                        let (endpoint, dd) = if segment.from == USER {
                            (a, to)
                        } else {
                            (b, from)
                        };
                        let Some(dd) = dd.filter(|_| endpoint == loc) else {
                            continue;
                        };
                        let yy = self.yy_var(i, p, a, b);
                        let y = self.y_var((request.id, p, a, b));
                        self.model.constrain(
                            format!("user_yy_{}_{}_{}_{}_{}", request.id, loc, p, a, b),
                            LinearExpr::var(yy).plus(dd, -1.0),
                            Sense::Eq,
                            0.0,
                        );
                        self.model.constrain(
                            format!("user_y_{}_{}_{}_{}_{}", request.id, loc, p, a, b),
                            LinearExpr::var(y).plus(yy, -1.0),
                            Sense::Eq,
                            0.0,
                        );
                    } else if let (Some(d1), Some(d2)) = (from, to) {
                        let yy = self.yy_var(i, p, a, b);
                        let y = self.y_var((request.id, p, a, b));
                        let tag = format!("{}_{}_{}_{}_{}", request.id, loc, p, a, b);
                        self.model.constrain(
                            format!("yy_src_{tag}"),
                            LinearExpr::var(yy).plus(d1, -1.0),
                            Sense::Le,
                            0.0,
                        );
                        self.model.constrain(
                            format!("yy_dst_{tag}"),
                            LinearExpr::var(yy).plus(d2, -1.0),
                            Sense::Le,
                            0.0,
                        );
                        self.model.constrain(
                            format!("yy_both_{tag}"),
                            LinearExpr::var(yy).plus(d1, -1.0).plus(d2, -1.0),
                            Sense::Ge,
                            -1.0,
                        );
                        self.model.constrain(
                            format!("y_cover_{tag}"),
                            LinearExpr::var(y).plus(yy, -1.0),
                            Sense::Ge,
                            0.0,
                        );
                    }
                }
            }
        }
    }

    /// Tie logical `delta` and `y` to the instance indicators.
    fn link_logical_requests(&mut self, requests: &[Request], apps: &[&App]) {
        let n = self.topology.len();
        let mut by_request: BTreeMap<RequestId, Vec<usize>> = BTreeMap::new();
        for (i, request) in requests.iter().enumerate() {
            by_request.entry(request.id).or_default().push(i);
        }
        for (r, instances) in &by_request {
            let app = apps[instances[0]];
            for d in 0..n {
                for f in app.functions() {
                    let dds: Vec<VarId> = instances
                        .iter()
                        .filter_map(|i| self.dd(*i, d, *f))
                        .collect();
                    if dds.is_empty() {
                        continue;
                    }
                    let delta = self.model.add_binary(format!("delta_{r}_{d}_{f}"));
                    self.index.delta.insert((*r, d, *f), delta);
                    let mut any = LinearExpr::var(delta);
                    for dd in &dds {
                        self.model.constrain(
                            format!("delta_cover_{r}_{d}_{f}_{}", dd.0),
                            LinearExpr::var(delta).plus(*dd, -1.0),
                            Sense::Ge,
                            0.0,
                        );
                        any.add_term(*dd, -1.0);
                    }
                    self.model
                        .constrain(format!("delta_used_{r}_{d}_{f}"), any, Sense::Le, 0.0);
                }
            }
        }

        let real: Vec<(RequestLink, VarId)> = self
            .index
            .y
            .iter()
            .filter(|((r, p, _, _), _)| {
                let n = apps[by_request[r][0]].real_pairs() as u32;
                (1..=n).contains(p)
            })
            .map(|(k, v)| (*k, *v))
            .collect();
        for ((r, p, a, b), y) in real {
            let mut expr = LinearExpr::var(y);
            for i in &by_request[&r] {
                if let Some(yy) = self.index.yy.get(&(*i, p, a, b)) {
                    expr.add_term(*yy, -1.0);
                }
            }
            self.model
                .constrain(format!("y_used_{r}_{p}_{a}_{b}"), expr, Sense::Le, 0.0);
        }
    }

    fn resource_limits(&mut self, catalog: &Catalog) {
        let mut per_node: BTreeMap<NodeId, LinearExpr> = BTreeMap::new();
        for ((_, d, f), var) in &self.index.delta {
            per_node
                .entry(*d)
                .or_default()
                .add_term(*var, catalog.size(*f) as f64);
        }
        for (d, expr) in per_node {
            let capacity = self.topology.node(d).capacity() as f64;
            self.model.constrain(format!("capacity_{d}"), expr, Sense::Le, capacity);
        }

        let mut per_link: BTreeMap<(NodeId, NodeId), LinearExpr> = BTreeMap::new();
        for ((_, _, a, b), var) in &self.index.y {
            per_link.entry((*a, *b)).or_default().add_term(*var, 1.0);
        }
        for ((a, b), expr) in per_link {
            let bw = self.bandwidth(a, b) as f64;
            self.model.constrain(format!("bandwidth_{a}_{b}"), expr, Sense::Le, bw);
        }
    }

    fn pin_to_user_location(&mut self, requests: &[Request]) {
        let pinned: Vec<VarId> = self
            .index
            .dd
            .iter()
            .filter(|((i, d, _), _)| *d != requests[*i].location)
            .map(|(_, v)| *v)
            .collect();
        for var in pinned {
            self.model.fix(var, false);
        }
    }

    /// Every function of an instance on one node, or none there.
    fn forbid_split(&mut self, requests: &[Request], apps: &[&App]) {
        for (i, request) in requests.iter().enumerate() {
            let functions = apps[i].functions();
            for d in 0..self.topology.len() {
                for pair in functions.windows(2) {
                    match (self.dd(i, d, pair[0]), self.dd(i, d, pair[1])) {
                        (Some(a), Some(b)) => self.model.constrain(
                            format!("non_split_{}_{}_{}_{}", request.id, request.location, d, pair[0]),
                            LinearExpr::var(a).plus(b, -1.0),
                            Sense::Eq,
                            0.0,
                        ),
                        (Some(v), None) | (None, Some(v)) => self.model.fix(v, false),
                        (None, None) => {}
                    }
                }
            }
        }
    }

    /// Delay of pair `p` for instance `i`, over its link indicators.
    fn route_delay(&self, i: usize, p: u32) -> LinearExpr {
        let mut expr = LinearExpr::new();
        for ((inst, pair, a, b), var) in &self.index.yy {
            if *inst == i && *pair == p {
                expr.add_term(*var, self.topology.delay(*a, *b) as f64);
            }
        }
        expr
    }

    fn processing(&self, i: usize, f: FunctionId, catalog: &Catalog) -> (LinearExpr, LinearExpr) {
        let mut delay = LinearExpr::new();
        let mut placed = LinearExpr::new();
        for d in 0..self.topology.len() {
            if let Some(var) = self.dd(i, d, f) {
                delay.add_term(var, self.topology.proc_delay(d, catalog.size(f)) as f64);
                placed.add_term(var, 1.0);
            }
        }
        (delay, placed)
    }

    /// `s = (sum >= 1)` for a 0/1 sum bounded by `big_m`.
    fn at_least_one(&mut self, name: String, sum: &LinearExpr, big_m: f64) -> VarId {
        let s = self.model.add_binary(name.clone());
        let mut hi = sum.clone();
        hi.add_term(s, -big_m);
        self.model
            .constrain(format!("{name}_on"), hi.clone(), Sense::Ge, 1.0 - big_m);
        self.model.constrain(format!("{name}_off"), hi, Sense::Le, 0.0);
        s
    }

    /// Build the per-pair satisfaction indicators of instance `i` and return
    /// its chain indicator `st`.
    fn chain_satisfaction(&mut self, i: usize, request: &Request, app: &App, catalog: &Catalog) -> VarId {
        let n = app.real_pairs();
        let tag = format!("{}_{}", request.id, request.location);
        let mut satisfied = LinearExpr::new();
        let mut chain_delay = LinearExpr::new();
        for p in 1..=n {
            let segment = *app.segment(p);
            let mut x = self.route_delay(i, p as u32);
            if p == 1 {
                x.add_expr(&self.route_delay(i, 0), 1.0);
            }
            if p == n {
                x.add_expr(&self.route_delay(i, n as u32 + 1), 1.0);
            }
            let (proc_from, placed_from) = self.processing(i, segment.from, catalog);
            let (proc_to, placed_to) = self.processing(i, segment.to, catalog);
            x.add_expr(&proc_from, 1.0);
            x.add_expr(&proc_to, 1.0);

            let budget = segment.budget as f64;
            let big_m = budget + 10.0;
            let count_m = big_m.max(self.topology.len() as f64 + 1.0);
            let s2 = self.at_least_one(format!("s2_{tag}_{p}"), &placed_from, count_m);
            let s3 = self.at_least_one(format!("s3_{tag}_{p}"), &placed_to, count_m);
            let s = self.model.add_binary(format!("s_{tag}_{p}"));
            let mut parts = vec![s2, s3];

            match self.options.objective {
                ObjectiveMode::Pairwise => {
                    let s1 = self.model.add_binary(format!("s1_{tag}_{p}"));
                    self.model.set_hint(s1, true);
                    let mut within = x.clone();
                    within.add_term(s1, big_m);
                    self.model.constrain(
                        format!("s1_{tag}_{p}_within"),
                        within.clone(),
                        Sense::Le,
                        budget + big_m,
                    );
                    self.model.constrain(
                        format!("s1_{tag}_{p}_over"),
                        within,
                        Sense::Ge,
                        budget + 1.0,
                    );
                    parts.push(s1);
                }
                ObjectiveMode::EndToEnd => chain_delay.add_expr(&x, 1.0),
            }

            let mut all = LinearExpr::var(s);
            for part in &parts {
                self.model.constrain(
                    format!("s_{tag}_{p}_needs_{}", part.0),
                    LinearExpr::var(s).plus(*part, -1.0),
                    Sense::Le,
                    0.0,
                );
                all.add_term(*part, -1.0);
            }
            self.model.constrain(
                format!("s_{tag}_{p}_all"),
                all,
                Sense::Ge,
                1.0 - parts.len() as f64,
            );
            satisfied.add_term(s, 1.0);
        }
        if self.options.objective == ObjectiveMode::EndToEnd {
            self.model.constrain(
                format!("e2e_{tag}"),
                chain_delay,
                Sense::Le,
                app.total_budget() as f64,
            );
        }

        let pairs = n as f64;
        let big_m = pairs.max(9.0) + 1.0;
        let st = self.model.add_binary(format!("st_{tag}"));
        self.model
            .set_priority(st, (100.0 * request.weight).trunc() * request.revenue as f64);
        let mut sum = satisfied;
        sum.add_term(st, -big_m);
        self.model
            .constrain(format!("st_{tag}_on"), sum.clone(), Sense::Ge, pairs - big_m);
        self.model
            .constrain(format!("st_{tag}_off"), sum, Sense::Le, pairs - 1.0);
        self.index.st.push(st);
        st
    }

    /// Migration cost of every non-resident function the request would start.
    fn state_cost(&self, request: RequestId, app: &App) -> LinearExpr {
        let mut cost = LinearExpr::new();
        for d in 0..self.topology.len() {
            for f in app.functions() {
                if let Some(var) = self.index.delta.get(&(request, d, *f)) {
                    let launch = self.topology.node(d).launch_cost(request, *f);
                    cost.add_term(*var, launch as f64);
                }
            }
        }
        cost
    }

    /// Accept a fanned-out request with enough probability mass, or not at all.
    fn acceptance_threshold(&mut self, requests: &[Request], threshold: f64) -> Result<(), InputError> {
        let mut by_request: BTreeMap<RequestId, Vec<usize>> = BTreeMap::new();
        for (i, request) in requests.iter().enumerate() {
            by_request.entry(request.id).or_default().push(i);
        }
        for (r, instances) in by_request {
            let total_weight = requests[instances[0]].total_weight;
            if total_weight == 0.0 {
                return Err(InputError::ZeroTotalWeight { request: r });
            }
            let required = threshold - (1.0 - total_weight);
            if required <= 0.0 {
                continue;
            }
            let z = self.model.add_binary(format!("z_{r}"));
            let mut mass = LinearExpr::new();
            for i in &instances {
                mass.add_term(self.index.st[*i], requests[*i].weight);
            }
            let mut enough = mass.clone();
            enough.add_term(z, -required);
            self.model
                .constrain(format!("z_{r}_enough"), enough, Sense::Ge, 0.0);
            mass.add_term(z, -1.0);
            self.model.constrain(format!("z_{r}_any"), mass, Sense::Le, 0.0);
        }
        Ok(())
    }
}
