use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sfcsim_core::config::{RunKind, SimConfig};
use sfcsim_core::{load_inputs, run_kind};
use sfcsim_placement::CoverageHeuristic;

fn bench_config(nodes: u32, users: u32) -> SimConfig {
    SimConfig::from_str(&format!(
        r#"
[run]
name = "bench"
seed = 42
duration = 3
kinds = ["regular"]

[topology]
nodes = {}
grid_width = 4
capacity = 12

[requests]
users = {}

[exact]
node_limit = 2000
"#,
        nodes, users
    ))
    .unwrap()
}

fn bench_heuristic_placement(c: &mut Criterion) {
    let config = bench_config(16, 200);
    let inputs = load_inputs(&config, 42).unwrap();
    let heuristic = CoverageHeuristic::new(&inputs.catalog);
    let threshold = config.mobility.heuristic_threshold;
    let n = inputs.topology.len();

    c.bench_function("heuristic_place_200_requests_16_nodes", |b| {
        b.iter(|| {
            let mut topology = inputs.topology.clone();
            let mut placed = 0;
            for request in inputs.requests(0) {
                let probs = inputs
                    .mobility
                    .heuristic_probs(0, request.id, request.location, threshold, n);
                if heuristic
                    .place(&mut topology, black_box(request), &probs)
                    .unwrap()
                    .is_some()
                {
                    placed += 1;
                }
            }
            placed
        })
    });
}

fn bench_regular_replicate(c: &mut Criterion) {
    let config = bench_config(9, 20);
    let inputs = load_inputs(&config, 42).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("logs_regular");

    let mut group = c.benchmark_group("replicate");
    group.sample_size(10);
    group.bench_function("regular_3_intervals_9_nodes", |b| {
        b.iter(|| {
            run_kind(
                black_box(&config),
                black_box(&inputs),
                RunKind::Regular,
                &dir,
                42,
                0.0,
            )
            .unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_heuristic_placement, bench_regular_replicate);
criterion_main!(benches);
