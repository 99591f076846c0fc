//! Interval engine of one run kind.
//!
//! Predictive kinds alternate two phases per interval `t`:
//!
//! ```text
//!   Adjust(t)   reconcile the Predict(t-1) reservations with requests[t],
//!               then place whatever is left on the same topology
//!   Predict(t)  fan requests[t] out over their likely next locations
//!               and reserve for interval t+1 on a fresh topology
//! ```
//!
//! Online kinds place each interval's realized requests directly, and the
//! heuristic kind keeps one physical topology alive for the whole run.

use crate::admission::{prune_low_revenue, AdaptiveController};
use crate::artifacts::{
    ArtifactSink, PlacedAppRow, PlacedFunctionRow, RuntimeRow, PLACED_APPS, PLACED_FUNCTIONS,
    RUNTIME,
};
use crate::config::{RunKind, SimConfig};
use crate::loader::Inputs;
use crate::metrics::{format_table, IntervalRecord, MetricsCollector, RunSummary};
use crate::reconcile::{commit, reconcile, update_residency, PredictionState};
use crate::weighting::{weighted_fan_out, FanOutOptions, Prediction};
use crate::SimError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sfcsim_placement::{
    replay, CoverageHeuristic, ExactFormulation, ExactOutcome, InvariantViolation, ModelKind,
    Phase, Request, RequestId, RequestPlacement, ReservationLedger, Topology,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info};

const PREALLOCATE: &str = "Preallocate";
const ACTUAL: &str = "Actual";
const HEURISTIC: &str = "Heuristic";

/// Utilization at or above which a node's state cost rises.
const HOT_UTILIZATION: f64 = 0.95;
/// Utilization at or below which a node's state cost falls.
const COLD_UTILIZATION: f64 = 0.05;

/// Runs one [`RunKind`] over the inputs of a replicate.
pub struct IntervalEngine<'a> {
    config: &'a SimConfig,
    inputs: &'a Inputs,
    kind: RunKind,
    sink: ArtifactSink,
    controller: AdaptiveController,
    rng: ChaCha8Rng,
    metrics: MetricsCollector,
    seed: u64,
    value: f64,
}

impl<'a> IntervalEngine<'a> {
    pub fn new(
        config: &'a SimConfig,
        inputs: &'a Inputs,
        kind: RunKind,
        sink: ArtifactSink,
        seed: u64,
    ) -> Self {
        Self {
            config,
            inputs,
            kind,
            sink,
            controller: AdaptiveController::new(
                &config.admission,
                config.requests.initial_realistic_capacity,
            ),
            rng: ChaCha8Rng::seed_from_u64(seed),
            metrics: MetricsCollector::new(),
            seed,
            value: 0.0,
        }
    }

    /// Tag the summary with the sweep value this run belongs to.
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    /// Run every interval and write the summary artifacts.
    pub fn run(mut self) -> Result<RunSummary, SimError> {
        info!(kind = %self.kind, seed = self.seed, value = self.value, "run started");
        self.sink
            .write_inputs(&self.inputs.topology, &self.inputs.catalog)?;
        match self.kind {
            RunKind::Heuristic => self.run_heuristic()?,
            RunKind::Online | RunKind::OnlineFull => self.run_online()?,
            RunKind::Regular | RunKind::Full | RunKind::LocationError => self.run_predictive()?,
        }
        let summary = self
            .metrics
            .aggregate(self.kind.name(), self.seed, self.value);
        self.sink.write_summary(&summary)?;
        self.sink.note(&format_table(&summary))?;
        self.sink.finish()?;
        info!(
            kind = %self.kind,
            served = summary.served,
            demand = summary.demand,
            revenue = summary.revenue,
            "run finished"
        );
        Ok(summary)
    }

    fn duration(&self) -> usize {
        self.config.run.duration as usize
    }

    fn run_predictive(&mut self) -> Result<(), SimError> {
        let mut carried = self.inputs.topology.clone();
        let mut pending: Option<PredictionState> = None;
        for t in 0..self.duration() {
            if let Some(state) = pending.take() {
                carried = self.adjust(t, state)?;
            }
            if t + 1 == self.duration() {
                break;
            }
            pending = Some(self.predict(t, &carried)?);
        }
        Ok(())
    }

    /// Reserve for interval `t + 1` from the requests of interval `t`.
    fn predict(&mut self, t: usize, carried: &Topology) -> Result<PredictionState, SimError> {
        let inputs = self.inputs;
        let catalog = &inputs.catalog;
        let time = t as u32 + 1;
        let full = self.kind.is_full();
        let origins = inputs.requests(t);
        debug!(t, requests = origins.len(), "predict phase");

        let mut topology = inputs.topology.clone();
        topology.carry_state_from(carried);

        let mobility = &inputs.mobility;
        let prediction = if self.kind == RunKind::LocationError {
            Prediction::NextInterval(inputs.requests(t + 1))
        } else if !mobility.per_user.is_empty() {
            Prediction::PerUser(&mobility.per_user)
        } else if let Some(matrix) = mobility.matrix(t) {
            Prediction::Matrix(matrix)
        } else {
            Prediction::Realized
        };
        let perturbed = self.kind == RunKind::LocationError || self.config.location_error.enabled;
        let error_rate = if perturbed {
            self.config.location_error.rate
        } else {
            0.0
        };
        let options = FanOutOptions {
            threshold: fan_out_threshold(self.kind, self.config),
            estimated: true,
            error_rate,
            exit_rate: self.config.mobility.levy_walk_exit_rate,
            limit: (self.config.requests.limit_user_requests && !full)
                .then_some(self.config.requests.initial_realistic_capacity as usize),
        };
        let mut instances =
            weighted_fan_out(origins, prediction, &topology, &options, &mut self.rng)?;
        let mut admitted = origins.to_vec();
        self.sink.write_original(t as u32, origins, catalog)?;

        let prunes = !full
            && self.kind != RunKind::LocationError
            && self.config.admission.low_revenue_pruning;
        if prunes && !instances.is_empty() {
            (instances, admitted) =
                self.prune(time, PREALLOCATE, instances, origins, &topology, true)?;
        }
        self.sink.write_prealloc(time, &instances, catalog)?;

        let outcome = self.solve(&topology, &instances, ModelKind::Preallocate)?;
        let mut state = PredictionState::new(topology);
        let paid = commit(
            &mut state.topology,
            &mut state.ledger,
            &outcome,
            catalog,
            Phase::Predict,
        )?;
        update_residency(&mut state.topology, &outcome, &instances, catalog);
        let ratio = self.controller.estimated.ratio;
        let placed = self.analyze(
            time,
            PREALLOCATE,
            &state.topology,
            &instances,
            &outcome,
            &paid,
            admitted.len(),
            ratio,
        )?;
        if !full {
            self.adapt(true, outcome.gap, admitted.len(), placed, time)?;
        }
        state.record(outcome, &instances);
        Ok(state)
    }

    /// Serve the realized requests of interval `t` and return the topology
    /// the next prediction carries its migration state from.
    fn adjust(&mut self, t: usize, mut state: PredictionState) -> Result<Topology, SimError> {
        let inputs = self.inputs;
        let catalog = &inputs.catalog;
        let time = t as u32;
        let actual = inputs.requests(t);
        debug!(t, requests = actual.len(), "adjust phase");

        let recon = reconcile(
            &mut state,
            actual,
            catalog,
            self.config.exact.check_broken_chains,
        )?;
        self.metrics.record_reconcile(recon.counts);
        for served in &recon.served {
            let r = &served.request;
            self.sink.write(
                PLACED_APPS,
                &PlacedAppRow {
                    time,
                    kind: ACTUAL,
                    request: r.id,
                    dc: r.location,
                    app: r.app,
                    size: app_size(inputs, r),
                    revenue: r.revenue,
                    predicted: served.predicted as u8,
                    cost_paid: 0,
                    weight: 1.0,
                    redirected: served.redirected as u8,
                },
            )?;
        }
        let c = recon.counts;
        self.sink.note(&format!(
            "t={} reconcile served={} placed={} repurposed={} redirected={} not_reused={} expired={} new={}",
            time, c.served, c.placed, c.repurposed, c.redirected, c.missed, c.expired, c.new
        ))?;

        let mut instances = weighted_fan_out(
            &recon.to_serve,
            Prediction::Realized,
            &state.topology,
            &FanOutOptions::default(),
            &mut self.rng,
        )?;
        let mut origins = recon.to_serve.clone();
        let adaptive = !self.kind.is_full() && self.kind != RunKind::LocationError;
        if adaptive && self.config.admission.low_revenue_pruning && !instances.is_empty() {
            (instances, origins) = self.prune(
                time,
                ACTUAL,
                instances,
                &recon.to_serve,
                &state.topology,
                false,
            )?;
        }

        let start = capacities(&state.topology);
        let outcome = self.solve(&state.topology, &instances, ModelKind::Adjust)?;
        let paid = commit(
            &mut state.topology,
            &mut state.ledger,
            &outcome,
            catalog,
            Phase::Adjust,
        )?;
        update_residency(&mut state.topology, &outcome, &instances, catalog);
        let ratio = self.controller.actual.ratio;
        let placed = self.analyze(
            time,
            ACTUAL,
            &state.topology,
            &instances,
            &outcome,
            &paid,
            origins.len(),
            ratio,
        )?;
        self.update_state_costs(time, &mut state.topology, &start)?;

        let fresh = outcome.placed();
        let revenue = recon
            .served
            .iter()
            .map(|s| s.request.revenue as u64)
            .sum::<u64>()
            + revenue_of(&recon.to_serve, &fresh);
        self.metrics
            .record_service(actual.len(), recon.served.len() + fresh.len(), revenue);

        if adaptive {
            self.adapt(false, outcome.gap, origins.len(), placed, time)?;
        }
        if t + 1 == self.duration() {
            self.sink.write_original(time, actual, catalog)?;
        }
        Ok(state.topology)
    }

    fn run_online(&mut self) -> Result<(), SimError> {
        let inputs = self.inputs;
        let catalog = &inputs.catalog;
        let adaptive = self.kind == RunKind::Online;
        if self.config.location_error.enabled {
            debug!(kind = %self.kind, "location error ignored for realized requests");
        }
        let mut carried = inputs.topology.clone();
        for t in 1..self.duration() {
            let time = t as u32;
            let requests = inputs.requests(t);
            debug!(t, requests = requests.len(), "online interval");
            let mut topology = inputs.topology.clone();
            topology.carry_state_from(&carried);
            self.sink.write_original(time, requests, catalog)?;

            let mut instances = weighted_fan_out(
                requests,
                Prediction::Realized,
                &topology,
                &FanOutOptions::default(),
                &mut self.rng,
            )?;
            let mut origins = requests.to_vec();
            if adaptive && self.config.admission.low_revenue_pruning && !instances.is_empty() {
                (instances, origins) =
                    self.prune(time, ACTUAL, instances, requests, &topology, false)?;
            }

            let start = capacities(&topology);
            let outcome = self.solve(&topology, &instances, ModelKind::Adjust)?;
            let mut ledger = ReservationLedger::new();
            let paid = commit(&mut topology, &mut ledger, &outcome, catalog, Phase::Adjust)?;
            update_residency(&mut topology, &outcome, &instances, catalog);
            let ratio = self.controller.actual.ratio;
            let placed = self.analyze(
                time,
                ACTUAL,
                &topology,
                &instances,
                &outcome,
                &paid,
                origins.len(),
                ratio,
            )?;
            self.update_state_costs(time, &mut topology, &start)?;

            let served = outcome.placed();
            self.metrics
                .record_service(requests.len(), served.len(), revenue_of(requests, &served));
            if adaptive {
                self.adapt(false, outcome.gap, origins.len(), placed, time)?;
            }
            carried = topology;
        }
        Ok(())
    }

    fn run_heuristic(&mut self) -> Result<(), SimError> {
        let inputs = self.inputs;
        let catalog = &inputs.catalog;
        let heuristic = CoverageHeuristic::new(catalog);
        let threshold = self.config.mobility.heuristic_threshold;
        let error_rate = if self.config.location_error.enabled {
            self.config.location_error.rate
        } else {
            0.0
        };
        let mut physical = inputs.topology.clone();
        let mut placements: BTreeMap<RequestId, Option<RequestPlacement>> = BTreeMap::new();

        for t in 0..self.duration() {
            let time = t as u32;
            let started = Instant::now();
            let mut requests = inputs.requests(t).to_vec();
            requests.sort_by(|a, b| b.revenue.cmp(&a.revenue).then(a.id.cmp(&b.id)));
            self.sink.write_original(time, &requests, catalog)?;

            let current: BTreeSet<RequestId> = requests.iter().map(|r| r.id).collect();
            let expired: Vec<RequestId> = placements
                .keys()
                .filter(|id| !current.contains(id))
                .copied()
                .collect();
            for id in expired {
                if let Some(Some(placement)) = placements.remove(&id) {
                    heuristic.release(&mut physical, &placement)?;
                }
            }

            let mut fresh = 0;
            for request in &requests {
                if placements.contains_key(&request.id) {
                    continue;
                }
                let probs = inputs.mobility.heuristic_probs(
                    t,
                    request.id,
                    request.location,
                    threshold,
                    physical.len(),
                );
                let placement = heuristic.place(&mut physical, request, &probs)?;
                if placement.is_some() {
                    fresh += 1;
                }
                placements.insert(request.id, placement);
            }

            let committed: BTreeMap<RequestId, RequestPlacement> = placements
                .iter()
                .filter_map(|(id, p)| p.clone().map(|p| (*id, p)))
                .collect();
            let mut work = physical.clone();
            let rng = &mut self.rng;
            let outcome = replay(catalog, &mut work, &requests, &committed, || {
                rng.gen::<f64>() < error_rate
            })?;
            let elapsed = started.elapsed();

            for request in &requests {
                if !outcome.placed.get(&request.id).copied().unwrap_or(false) {
                    continue;
                }
                let (Some(placement), Some(location)) =
                    (committed.get(&request.id), outcome.realized.get(&request.id))
                else {
                    continue;
                };
                self.sink.write(
                    PLACED_APPS,
                    &PlacedAppRow {
                        time,
                        kind: HEURISTIC,
                        request: request.id,
                        dc: *location,
                        app: request.app,
                        size: app_size(inputs, request),
                        revenue: request.revenue,
                        predicted: !placement.has_dynamic() as u8,
                        cost_paid: 0,
                        weight: 1.0,
                        redirected: 0,
                    },
                )?;
                if let Some(assignment) = placement.assignment(*location) {
                    for (function, place) in assignment {
                        self.sink.write(
                            PLACED_FUNCTIONS,
                            &PlacedFunctionRow {
                                time,
                                kind: HEURISTIC,
                                request: request.id,
                                function: *function,
                                dc: place.node(),
                                size: catalog.size(*function),
                            },
                        )?;
                    }
                }
            }
            self.sink
                .write_utilization(time, HEURISTIC, &work, &outcome.static_unused)?;

            let served: BTreeSet<RequestId> = outcome
                .placed
                .iter()
                .filter(|(_, p)| **p)
                .map(|(id, _)| *id)
                .collect();
            self.metrics
                .record_service(requests.len(), served.len(), revenue_of(&requests, &served));
            self.metrics.record(IntervalRecord {
                time,
                phase: HEURISTIC.to_string(),
                instances: requests.len(),
                placed: served.len(),
                gap: 0.0,
                nodes: 0,
                elapsed_ms: elapsed.as_secs_f64() * 1000.0,
                capacity_ratio: 0.0,
            });
            self.sink.note(&format!(
                "t={} heuristic requests={} newly_placed={} served={}",
                time,
                requests.len(),
                fresh,
                served.len()
            ))?;
            info!(t, requests = requests.len(), served = served.len(), "heuristic interval");
        }
        Ok(())
    }

    /// Open a solver session, solve one model and drop the session.
    fn solve(
        &self,
        topology: &Topology,
        instances: &[Request],
        kind: ModelKind,
    ) -> Result<ExactOutcome, SimError> {
        let name = &self.config.exact.solver;
        let mut solver = sfcsim_placement::solver_by_name(name)
            .ok_or_else(|| SimError::UnknownSolver(name.clone()))?;
        let mut budget = self.config.solve_budget(self.kind);
        if !kind.is_estimated() {
            budget = budget.scaled_down(5);
        }
        let formulation = ExactFormulation::new(
            topology,
            &self.inputs.catalog,
            self.config.formulation_options(),
        );
        Ok(formulation.solve(instances, kind, solver.as_mut(), &budget)?)
    }

    fn prune(
        &mut self,
        time: u32,
        phase: &'static str,
        instances: Vec<Request>,
        origins: &[Request],
        topology: &Topology,
        estimated: bool,
    ) -> Result<(Vec<Request>, Vec<Request>), SimError> {
        let acceptance = self.config.requests.acceptance_threshold;
        let params = if estimated {
            self.controller.estimated.params(acceptance)
        } else {
            self.controller.actual.params(acceptance)
        };
        let outcome = prune_low_revenue(instances, origins, topology, &self.inputs.catalog, params)?;
        self.sink
            .write_pruned(time, phase, &outcome.considered, &self.inputs.catalog)?;
        let state = if estimated {
            &mut self.controller.estimated
        } else {
            &mut self.controller.actual
        };
        state.previous = outcome.instances.len();
        Ok((outcome.instances, outcome.origins))
    }

    fn adapt(
        &mut self,
        estimated: bool,
        gap: f64,
        requests: usize,
        allocated: usize,
        time: u32,
    ) -> Result<(), InvariantViolation> {
        let acceptable = self.controller.acceptable_gap;
        let state = if estimated {
            &mut self.controller.estimated
        } else {
            &mut self.controller.actual
        };
        AdaptiveController::observe(acceptable, state, gap, requests, allocated, time)
    }

    /// Write the rows describing one solve. Returns the number of logical
    /// requests it placed.
    #[allow(clippy::too_many_arguments)]
    fn analyze(
        &mut self,
        time: u32,
        phase: &'static str,
        topology: &Topology,
        instances: &[Request],
        outcome: &ExactOutcome,
        paid: &BTreeMap<RequestId, u32>,
        requests: usize,
        ratio: f64,
    ) -> Result<usize, SimError> {
        let inputs = self.inputs;
        let placed = outcome.placed();
        self.sink.write_attempted(time, phase, instances)?;
        for r in instances {
            if !outcome.is_accepted(r.id, r.location) {
                continue;
            }
            self.sink.write(
                PLACED_APPS,
                &PlacedAppRow {
                    time,
                    kind: phase,
                    request: r.id,
                    dc: r.location,
                    app: r.app,
                    size: app_size(inputs, r),
                    revenue: r.revenue,
                    predicted: outcome.kind.is_estimated() as u8,
                    cost_paid: paid.get(&r.id).copied().unwrap_or(0),
                    weight: r.weight,
                    redirected: 0,
                },
            )?;
        }
        for (request, node, function) in &outcome.assignment {
            if !placed.contains(request) {
                continue;
            }
            self.sink.write(
                PLACED_FUNCTIONS,
                &PlacedFunctionRow {
                    time,
                    kind: phase,
                    request: *request,
                    function: *function,
                    dc: *node,
                    size: inputs.catalog.size(*function),
                },
            )?;
        }
        self.sink.write_utilization(time, phase, topology, &[])?;
        self.sink.write(
            RUNTIME,
            &RuntimeRow {
                time,
                kind: phase,
                nodes: outcome.nodes,
                elapsed_ms: outcome.elapsed.as_millis(),
                capacity_ratio: ratio,
                requests,
                gap: outcome.gap,
            },
        )?;

        let cost: u64 = paid.values().map(|c| *c as u64).sum();
        self.metrics.record_cost(cost);
        self.metrics.record(IntervalRecord {
            time,
            phase: phase.to_string(),
            instances: instances.len(),
            placed: placed.len(),
            gap: outcome.gap,
            nodes: outcome.nodes,
            elapsed_ms: outcome.elapsed.as_secs_f64() * 1000.0,
            capacity_ratio: ratio,
        });
        self.sink.note(&format!(
            "t={} {} instances={} requests={} placed={} gap={:.4} nodes={} cost={}",
            time,
            phase,
            instances.len(),
            requests,
            placed.len(),
            outcome.gap,
            outcome.nodes,
            cost
        ))?;
        Ok(placed.len())
    }

    fn update_state_costs(
        &mut self,
        time: u32,
        topology: &mut Topology,
        start: &[u32],
    ) -> Result<(), SimError> {
        if self.config.state_cost.dynamic {
            let step = state_cost_step(
                self.config.topology.state_cost,
                self.config.state_cost.step_percent,
            );
            adjust_state_costs(topology, start, step);
        }
        self.sink.write_state_costs(time, topology)?;
        Ok(())
    }
}

/// Probability a predicted destination must exceed to be fanned out to.
/// Full runs drop destinations sitting exactly on the prediction threshold.
fn fan_out_threshold(kind: RunKind, config: &SimConfig) -> f64 {
    if kind == RunKind::Full {
        config.mobility.prediction_threshold
    } else {
        0.0
    }
}

/// Amount a dynamic state cost moves by per adjustment. Integer division, so
/// a base cost below `step_percent` leaves costs fixed.
pub fn state_cost_step(state_cost: u32, step_percent: u32) -> u32 {
    state_cost.checked_div(step_percent).unwrap_or(0)
}

/// Raise the state cost of nodes that filled up since `start` and lower it
/// on nodes that stayed nearly empty.
pub fn adjust_state_costs(topology: &mut Topology, start: &[u32], step: u32) {
    for (id, initial) in start.iter().enumerate().take(topology.len()) {
        if *initial == 0 {
            continue;
        }
        let node = topology.node_mut(id);
        let used = initial.saturating_sub(node.capacity());
        let utilization = used as f64 / *initial as f64;
        let cost = node.state_cost();
        if utilization >= HOT_UTILIZATION {
            node.set_state_cost(cost + step);
        } else if utilization <= COLD_UTILIZATION && cost >= step {
            node.set_state_cost(cost - step);
        }
    }
}

fn capacities(topology: &Topology) -> Vec<u32> {
    topology.nodes().iter().map(|n| n.capacity()).collect()
}

fn app_size(inputs: &Inputs, request: &Request) -> u32 {
    inputs
        .catalog
        .app(request.app)
        .map(|a| a.total_size())
        .unwrap_or(0)
}

fn revenue_of(requests: &[Request], ids: &BTreeSet<RequestId>) -> u64 {
    let mut seen = BTreeSet::new();
    requests
        .iter()
        .filter(|r| ids.contains(&r.id) && seen.insert(r.id))
        .map(|r| r.revenue as u64)
        .sum()
}
