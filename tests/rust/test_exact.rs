/// Integration tests for the exact formulation and the Adjust-phase
/// reconciliation of its reservations.
use sfcsim_core::admission::{prune_low_revenue, PruneParams};
use sfcsim_core::reconcile::{commit, reconcile, PredictionState};
use sfcsim_placement::{
    BranchAndBound, Catalog, ExactFormulation, ExactOutcome, FormulationOptions, Function,
    InvariantViolation, ModelKind, NodeSpec, PairRow, Phase, Request, ReservationLedger,
    SolveBudget, Topology,
};

fn line(n: usize, capacity: u32, bandwidth: u32) -> Topology {
    let specs: Vec<NodeSpec> = (0..n)
        .map(|id| NodeSpec {
            id,
            x: id as i64,
            y: 0,
            capacity,
            processing_rate: 1,
            state_cost: 1,
        })
        .collect();
    Topology::ranged(&specs, 1, 1, bandwidth).unwrap()
}

fn two_function_catalog(budget: u32) -> Catalog {
    Catalog::new(vec![Function { id: 1, size: 1 }, Function { id: 2, size: 1 }])
        .with_pairs(&[PairRow { app: 1, pair: 1, from: 1, to: 2, budget }])
        .unwrap()
}

fn solve(topo: &Topology, catalog: &Catalog, requests: &[Request], kind: ModelKind) -> ExactOutcome {
    ExactFormulation::new(topo, catalog, FormulationOptions::default())
        .solve(requests, kind, &mut BranchAndBound::new(), &SolveBudget::nodes(200_000))
        .unwrap()
}

/// Solve and commit a prediction the way a Predict phase does.
fn predict(topo: Topology, catalog: &Catalog, instances: &[Request]) -> PredictionState {
    let outcome = solve(&topo, catalog, instances, ModelKind::Preallocate);
    let mut state = PredictionState::new(topo);
    commit(&mut state.topology, &mut state.ledger, &outcome, catalog, Phase::Predict).unwrap();
    state.record(outcome, instances);
    state
}

fn assert_conserved(topo: &Topology, ledger: &ReservationLedger) {
    for node in topo.nodes() {
        assert_eq!(
            node.capacity() + ledger.reserved_on(node.id),
            node.original_capacity(),
            "node {}",
            node.id
        );
    }
    for link in topo.links() {
        assert!(link.bandwidth() <= link.original_bandwidth());
        assert_eq!(
            link.bandwidth() + ledger.reserved_link(link.src, link.dst),
            link.original_bandwidth(),
            "link {}->{}",
            link.src,
            link.dst
        );
    }
}

#[test]
fn test_split_placement_uses_one_unit_per_link() {
    let catalog = two_function_catalog(5);
    let mut topo = line(2, 1, 1);
    let request = Request::new(1, 0, 1, 0, 10);
    let outcome = solve(&topo, &catalog, &[request], ModelKind::Adjust);
    assert!(outcome.is_accepted(1, 0));
    assert_eq!(outcome.functions_of(1).len(), 2);

    let mut ledger = ReservationLedger::new();
    let paid = commit(&mut topo, &mut ledger, &outcome, &catalog, Phase::Adjust).unwrap();
    assert_eq!(paid[&1], 2);
    assert_eq!(topo.node(0).capacity(), 0);
    assert_eq!(topo.node(1).capacity(), 0);
    assert_eq!(topo.link(0, 1).unwrap().bandwidth(), 0);
    assert_conserved(&topo, &ledger);
}

#[test]
fn test_commit_then_release_round_trips() {
    let catalog = two_function_catalog(5);
    let mut topo = line(3, 2, 2);
    let requests = [Request::new(1, 0, 1, 0, 10), Request::new(2, 0, 1, 2, 20)];
    let outcome = solve(&topo, &catalog, &requests, ModelKind::Adjust);
    assert_eq!(outcome.placed().len(), 2);

    let mut ledger = ReservationLedger::new();
    commit(&mut topo, &mut ledger, &outcome, &catalog, Phase::Adjust).unwrap();
    assert_conserved(&topo, &ledger);
    for id in [1, 2] {
        assert!(ledger.release_request(&mut topo, id).unwrap() > 0);
    }
    assert!(ledger.is_empty());
    for node in topo.nodes() {
        assert_eq!(node.capacity(), node.original_capacity());
    }
    for link in topo.links() {
        assert_eq!(link.bandwidth(), link.original_bandwidth());
    }
}

#[test]
fn test_committing_twice_never_double_reserves() {
    let catalog = two_function_catalog(5);
    let mut topo = line(2, 4, 2);
    let outcome = solve(&topo, &catalog, &[Request::new(1, 0, 1, 0, 10)], ModelKind::Adjust);
    let mut ledger = ReservationLedger::new();
    commit(&mut topo, &mut ledger, &outcome, &catalog, Phase::Adjust).unwrap();
    let capacities: Vec<u32> = topo.nodes().iter().map(|n| n.capacity()).collect();

    let err = commit(&mut topo, &mut ledger, &outcome, &catalog, Phase::Adjust).unwrap_err();
    assert!(matches!(err, InvariantViolation::DoubleReservation { request: 1, .. }));
    let after: Vec<u32> = topo.nodes().iter().map(|n| n.capacity()).collect();
    assert_eq!(capacities, after);
}

#[test]
fn test_mispredicted_user_is_redirected_without_fresh_placement() {
    let catalog = two_function_catalog(10);
    let predicted = Request::new(1, 0, 1, 0, 50);
    let mut state = predict(line(2, 4, 2), &catalog, &[predicted]);
    assert!(state.outcome.is_accepted(1, 0));

    let actual = Request::new(1, 1, 1, 1, 50);
    let out = reconcile(&mut state, &[actual], &catalog, true).unwrap();
    assert_eq!(out.counts.redirected, 1);
    assert_eq!(out.counts.missed, 0);
    assert!(out.to_serve.is_empty());
    assert_eq!(out.served.len(), 1);
    assert!(out.served[0].redirected);
    assert_eq!(state.ledger.functions_of(1).len(), 2);
    assert_conserved(&state.topology, &state.ledger);
}

#[test]
fn test_redirection_disabled_misses_and_frees() {
    let catalog = two_function_catalog(10);
    let predicted = Request::new(1, 0, 1, 0, 50);
    let mut state = predict(line(2, 4, 2), &catalog, &[predicted]);

    let actual = Request::new(1, 1, 1, 1, 50);
    let out = reconcile(&mut state, &[actual], &catalog, false).unwrap();
    assert_eq!(out.counts.redirected, 0);
    assert_eq!(out.counts.missed, 1);
    assert_eq!(out.to_serve.len(), 1);
    assert!(state.ledger.is_empty());
    assert_conserved(&state.topology, &state.ledger);
}

#[test]
fn test_fan_out_prediction_serves_either_location() {
    let catalog = two_function_catalog(10);
    let base = Request::new(1, 0, 1, 0, 50);
    let instances = [base.instance(0, 0.5, 1.0), base.instance(1, 0.5, 1.0)];
    let mut state = predict(line(2, 2, 2), &catalog, &instances);
    assert_eq!(state.outcome.accepted.len(), 2);
    // Shared delta variables charge capacity once for the logical request.
    assert_eq!(state.ledger.functions_of(1).len(), 2);

    let actual = Request::new(1, 1, 1, 1, 50);
    let out = reconcile(&mut state, &[actual], &catalog, true).unwrap();
    assert_eq!(out.counts.served, 1);
    assert!(out.served[0].predicted);
    assert!(!out.served[0].redirected);
    assert_conserved(&state.topology, &state.ledger);
}

#[test]
fn test_pruning_drops_lowest_revenue_first() {
    let catalog = two_function_catalog(10);
    let topo = line(1, 4, 1);
    let requests = vec![
        Request::new(1, 0, 1, 0, 10),
        Request::new(2, 0, 1, 0, 30),
        Request::new(3, 0, 1, 0, 20),
    ];
    let params = PruneParams {
        ratio: 1.0,
        max_limit: 100.0,
        acceptance: 0.5,
        previous: 0,
    };
    let out = prune_low_revenue(requests.clone(), &requests, &topo, &catalog, params).unwrap();
    let kept: Vec<u32> = out.instances.iter().map(|r| r.id).collect();
    assert_eq!(kept, vec![2, 3]);
    assert_eq!(out.dropped(), 1);
    assert!(!out.considered[0].used);
    assert_eq!(out.considered[0].id, 1);
    assert!(out.origins.iter().all(|r| r.id != 1));
}

#[test]
fn test_pruning_caps_growth_against_previous_interval() {
    let catalog = two_function_catalog(10);
    let topo = line(2, 100, 1);
    let requests: Vec<Request> = (1..=5)
        .map(|id| Request::new(id, 0, 1, (id % 2) as usize, id * 10))
        .collect();
    let params = PruneParams {
        ratio: 2.0,
        max_limit: 3.0,
        acceptance: 0.5,
        previous: 2,
    };
    let out = prune_low_revenue(requests.clone(), &requests, &topo, &catalog, params).unwrap();
    let kept: Vec<u32> = out.instances.iter().map(|r| r.id).collect();
    assert_eq!(kept, vec![3, 4, 5]);
}
