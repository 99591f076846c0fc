/// Integration tests for the coverage heuristic and its replay.
use sfcsim_placement::{
    replay, Catalog, CoverageHeuristic, Function, NodeSpec, PairRow, Request, RequestPlacement,
    Topology, VnfPlace,
};
use std::collections::BTreeMap;

fn line(n: usize, capacity: u32, delay: u32, bandwidth: u32) -> Topology {
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
    Topology::ranged(&specs, 1, delay, bandwidth).unwrap()
}

/// One app whose chain is functions `1..=sizes.len()` with `budgets` per pair.
fn chain(sizes: &[u32], budgets: &[u32]) -> Catalog {
    let functions = sizes
        .iter()
        .enumerate()
        .map(|(i, s)| Function { id: i as u32 + 1, size: *s })
        .collect();
    let rows: Vec<PairRow> = budgets
        .iter()
        .enumerate()
        .map(|(i, b)| PairRow {
            app: 1,
            pair: i as u32 + 1,
            from: i as u32 + 1,
            to: i as u32 + 2,
            budget: *b,
        })
        .collect();
    Catalog::new(functions).with_pairs(&rows).unwrap()
}

fn only(n: usize, at: usize) -> Vec<f64> {
    let mut probs = vec![0.0; n];
    probs[at] = 1.0;
    probs
}

fn assert_pristine(topo: &Topology) {
    for node in topo.nodes() {
        assert_eq!(node.capacity(), node.original_capacity(), "node {}", node.id);
        assert_eq!(node.dynamic_size(), 0, "node {}", node.id);
    }
    for link in topo.links() {
        assert_eq!(link.bandwidth(), link.original_bandwidth());
    }
}

#[test]
fn test_two_nodes_split_chain_and_consume_bandwidth() {
    let catalog = chain(&[1, 1], &[5]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(2, 1, 1, 1);
    let request = Request::new(1, 0, 1, 0, 10);

    let placement = heuristic
        .place(&mut topo, &request, &only(2, 0))
        .unwrap()
        .expect("chain fits across the link");
    assert_eq!(placement.physical_chain(), &[(1, 0), (2, 1)]);
    assert!(!placement.has_dynamic());

    let placements: BTreeMap<_, _> = [(1, placement)].into_iter().collect();
    let outcome = replay(&catalog, &mut topo, &[request], &placements, || false).unwrap();
    assert!(outcome.placed[&1]);
    assert_eq!(outcome.placed_count(), 1);
    assert_eq!(topo.link(0, 1).unwrap().bandwidth(), 0);
    assert_eq!(topo.link(0, 1).unwrap().original_bandwidth(), 1);
    assert_eq!(topo.node(0).capacity(), 0);
    assert_eq!(topo.node(1).capacity(), 0);
}

#[test]
fn test_no_bandwidth_and_no_room_fails() {
    let catalog = chain(&[1, 1], &[5]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(2, 1, 1, 0);
    let request = Request::new(1, 0, 1, 0, 10);
    assert!(heuristic.place(&mut topo, &request, &only(2, 0)).unwrap().is_none());
    assert_pristine(&topo);
}

#[test]
fn test_no_bandwidth_colocates_on_roomy_node() {
    let catalog = chain(&[1, 1], &[5]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(2, 2, 1, 0);
    let request = Request::new(1, 0, 1, 0, 10);

    let placement = heuristic
        .place(&mut topo, &request, &only(2, 0))
        .unwrap()
        .unwrap();
    assert_eq!(placement.physical_chain(), &[(1, 0), (2, 0)]);

    let placements: BTreeMap<_, _> = [(1, placement)].into_iter().collect();
    let outcome = replay(&catalog, &mut topo, &[request], &placements, || false).unwrap();
    assert!(outcome.placed[&1]);
    for link in topo.links() {
        assert_eq!(link.bandwidth(), link.original_bandwidth());
    }
}

#[test]
fn test_ample_resources_place_every_request() {
    let catalog = chain(&[1, 1, 1], &[20, 20]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(4, 12, 1, 5);
    for (id, at) in [(1, 0), (2, 1), (3, 2), (4, 3), (5, 1)] {
        let request = Request::new(id, 0, 1, at, 10);
        let placement = heuristic.place(&mut topo, &request, &only(4, at)).unwrap();
        assert!(placement.is_some(), "request {id} at node {at}");
    }
}

#[test]
fn test_place_then_release_round_trips() {
    let catalog = chain(&[1, 2, 1], &[9, 9]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(3, 3, 1, 2);
    let request = Request::new(1, 0, 1, 1, 10);

    let placement = heuristic
        .place(&mut topo, &request, &[0.2, 0.6, 0.2])
        .unwrap()
        .unwrap();
    assert!(topo.nodes().iter().any(|n| n.capacity() < n.original_capacity()));
    heuristic.release(&mut topo, &placement).unwrap();
    assert_pristine(&topo);
}

#[test]
fn test_capacity_is_conserved_across_placements() {
    let catalog = chain(&[1, 2], &[8]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(3, 4, 1, 3);
    let mut placements: Vec<RequestPlacement> = Vec::new();
    for id in 1..=6 {
        let request = Request::new(id, 0, 1, (id as usize) % 3, 10);
        let probs = only(3, request.location);
        if let Some(p) = heuristic.place(&mut topo, &request, &probs).unwrap() {
            placements.push(p);
        }
    }
    assert!(!placements.is_empty());
    for node in topo.nodes() {
        let reserved: u32 = placements
            .iter()
            .flat_map(|p| p.physical_chain().iter())
            .filter(|(_, d)| *d == node.id)
            .map(|(f, _)| catalog.size(*f))
            .sum();
        assert_eq!(node.capacity() + reserved, node.original_capacity());
    }
}

#[test]
fn test_far_location_is_served_dynamically() {
    let catalog = chain(&[1, 1], &[4]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(3, 3, 1, 1);
    let predicted = Request::new(1, 0, 1, 0, 10);

    let placement = heuristic
        .place(&mut topo, &predicted, &[0.6, 0.0, 0.4])
        .unwrap()
        .unwrap();
    let far = placement.assignment(2).unwrap();
    assert!(far.values().all(VnfPlace::is_dynamic));
    assert_eq!(topo.node(2).capacity(), 3);

    // The user shows up at the far node: dynamic capacity is taken now.
    let realized = Request::new(1, 1, 1, 2, 10);
    let placements: BTreeMap<_, _> = [(1, placement)].into_iter().collect();
    let outcome = replay(&catalog, &mut topo, &[realized], &placements, || false).unwrap();
    assert!(outcome.placed[&1]);
    assert_eq!(outcome.realized[&1], 2);
    assert_eq!(topo.node(2).dynamic_size(), 2);
    assert_eq!(topo.node(2).capacity(), 1);
}

#[test]
fn test_failed_dynamic_activation_rolls_back() {
    let catalog = chain(&[1, 1], &[4]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(3, 2, 1, 1);
    let predicted = Request::new(1, 0, 1, 0, 10);
    let placement = heuristic
        .place(&mut topo, &predicted, &[0.6, 0.0, 0.4])
        .unwrap()
        .unwrap();
    let before: Vec<u32> = topo.nodes().iter().map(|n| n.capacity()).collect();

    // Activation needs strictly more room than the function size, so the
    // second function cannot start on node 2.
    let realized = Request::new(1, 1, 1, 2, 10);
    let placements: BTreeMap<_, _> = [(1, placement)].into_iter().collect();
    let outcome = replay(&catalog, &mut topo, &[realized], &placements, || false).unwrap();
    assert!(!outcome.placed[&1]);
    let after: Vec<u32> = topo.nodes().iter().map(|n| n.capacity()).collect();
    assert_eq!(before, after);
    assert_eq!(topo.node(2).dynamic_size(), 0);
}

#[test]
fn test_uncovered_location_is_not_served() {
    let catalog = chain(&[1, 1], &[5]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(3, 2, 1, 1);
    let predicted = Request::new(1, 0, 1, 0, 10);
    let placement = heuristic
        .place(&mut topo, &predicted, &only(3, 0))
        .unwrap()
        .unwrap();
    assert!(!placement.covers(2));

    let realized = Request::new(1, 1, 1, 2, 10);
    let placements: BTreeMap<_, _> = [(1, placement)].into_iter().collect();
    let outcome = replay(&catalog, &mut topo, &[realized], &placements, || false).unwrap();
    assert!(!outcome.placed[&1]);
    assert!(outcome.static_unused.iter().sum::<u32>() > 0);
}

#[test]
fn test_three_function_chain_on_exact_budgets() {
    // segment 1 = p1 + p2 = 2, segment 2 = hop 1 + p3 + hop back 1 = 3
    let catalog = chain(&[1, 1, 1], &[2, 3]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(2, 2, 1, 1);
    let request = Request::new(1, 0, 1, 0, 10);

    let placement = heuristic
        .place(&mut topo, &request, &only(2, 0))
        .unwrap()
        .expect("every segment meets its budget exactly");
    assert_eq!(placement.physical_chain(), &[(1, 0), (2, 0), (3, 1)]);
    assert!(placement.covers(0));

    let placements: BTreeMap<_, _> = [(1, placement)].into_iter().collect();
    let outcome = replay(&catalog, &mut topo, &[request], &placements, || false).unwrap();
    assert!(outcome.placed[&1]);
}

#[test]
fn test_three_function_chain_one_over_budget_fails() {
    let catalog = chain(&[1, 1, 1], &[2, 2]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(2, 2, 1, 1);
    let request = Request::new(1, 0, 1, 0, 10);
    assert!(heuristic.place(&mut topo, &request, &only(2, 0)).unwrap().is_none());
    assert_pristine(&topo);
}

#[test]
fn test_four_function_chain_on_exact_budgets() {
    // f1 f2 at the user, f3 f4 one hop away: every segment costs 2
    let catalog = chain(&[1, 1, 1, 1], &[2, 2, 2]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(2, 2, 1, 1);
    let request = Request::new(1, 0, 1, 0, 10);

    let placement = heuristic
        .place(&mut topo, &request, &only(2, 0))
        .unwrap()
        .expect("every segment meets its budget exactly");
    assert_eq!(placement.physical_chain(), &[(1, 0), (2, 0), (3, 1), (4, 1)]);
    let app = catalog.app(1).unwrap();
    assert!(heuristic.is_placement_legal(&topo, app, 0, &[0, 0, 1, 1]));

    let placements: BTreeMap<_, _> = [(1, placement)].into_iter().collect();
    let outcome = replay(&catalog, &mut topo, &[request], &placements, || false).unwrap();
    assert!(outcome.placed[&1]);
}

#[test]
fn test_four_function_chain_tight_last_segment_fails() {
    let catalog = chain(&[1, 1, 1, 1], &[2, 2, 1]);
    let heuristic = CoverageHeuristic::new(&catalog);
    let mut topo = line(2, 2, 1, 1);
    let request = Request::new(1, 0, 1, 0, 10);
    assert!(heuristic.place(&mut topo, &request, &only(2, 0)).unwrap().is_none());
    assert_pristine(&topo);
}
