/// Integration tests for input loading: CSV files, synthetic generation and
/// rejection of malformed inputs.
use sfcsim_core::config::SimConfig;
use sfcsim_core::loader::{load_inputs, parse_matrices, parse_vectors, LoadError};
use sfcsim_placement::{Catalog, Function, InputError, PairRow};
use std::fs;

const NODES: &str = "dc,x,y,capacity,procPower\n0,0,0,8,1\n1,1,0,,1\n2,2,0,6,2\n";
const FUNCTIONS: &str = "id,size\n1,2\n2,1\n3,3\n";
const APPS: &str = "appID,functions,constraints,size\n1,1-2,6,3\n2,2-3-1,5-7,6\n";
const REQUESTS: &str = "time,reqID,dc,appID,revenue\n0,1,0,1,10\n0,2,2,2,30\n1,1,1,1,10\n1,2,2,2,30\n2,1,1,1,10\n9,3,0,1,5\n";

struct Files {
    dir: tempfile::TempDir,
}

impl Files {
    fn new(nodes: &str, functions: &str, apps: &str, requests: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("nodes.csv", nodes),
            ("functions.csv", functions),
            ("apps.csv", apps),
            ("requests.csv", requests),
        ] {
            fs::write(dir.path().join(name), body).unwrap();
        }
        Self { dir }
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    fn config(&self, extra: &str) -> SimConfig {
        SimConfig::from_str(&format!(
            r#"
[run]
duration = 3

[topology]
nodes_path = '{}'
capacity = 10
state_cost = 2

[functions]
path = '{}'

[apps]
path = '{}'

[requests]
path = '{}'
{extra}
"#,
            self.path("nodes.csv"),
            self.path("functions.csv"),
            self.path("apps.csv"),
            self.path("requests.csv"),
        ))
        .unwrap()
    }
}

fn load_error(files: &Files) -> LoadError {
    load_inputs(&files.config(""), 42).unwrap_err()
}

#[test]
fn test_load_from_files() {
    let files = Files::new(NODES, FUNCTIONS, APPS, REQUESTS);
    let inputs = load_inputs(&files.config(""), 42).unwrap();

    assert_eq!(inputs.topology.len(), 3);
    assert_eq!(inputs.topology.node(0).capacity(), 8);
    assert_eq!(inputs.topology.node(1).capacity(), 10);
    assert_eq!(inputs.topology.node(2).state_cost(), 2);
    assert_eq!(inputs.catalog.apps.len(), 2);
    assert_eq!(inputs.catalog.app(2).map(|a| a.total_size()), Some(6));

    assert_eq!(inputs.intervals.len(), 3);
    assert_eq!(inputs.requests(0).len(), 2);
    assert_eq!(inputs.requests(1).len(), 2);
    assert_eq!(inputs.requests(2).len(), 1);
    // Rows past the configured duration are dropped.
    assert!(inputs.intervals.iter().flatten().all(|r| r.id != 3));
}

#[test]
fn test_missing_file_names_the_path() {
    let files = Files::new(NODES, FUNCTIONS, APPS, REQUESTS);
    let mut config = files.config("");
    config.apps.path = Some(files.path("absent.csv"));
    match load_inputs(&config, 42) {
        Err(LoadError::Io { path, .. }) => assert!(path.ends_with("absent.csv")),
        other => panic!("expected Io error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_chain_with_unknown_function_rejected() {
    let apps = "appID,functions,constraints\n1,1-9,5\n";
    let files = Files::new(NODES, FUNCTIONS, apps, REQUESTS);
    assert!(matches!(
        load_error(&files),
        LoadError::Input(InputError::UnknownFunction { app: 1, function: 9 })
    ));
}

#[test]
fn test_chain_revisiting_a_function_rejected() {
    let apps = "appID,functions,constraints\n1,1-2-1,5-5\n2,2-3,4\n";
    let files = Files::new(NODES, FUNCTIONS, apps, REQUESTS);
    assert!(matches!(
        load_error(&files),
        LoadError::Input(InputError::BrokenChain { app: 1, pair: 2 })
    ));
}

#[test]
fn test_constraint_count_mismatch_rejected() {
    let apps = "appID,functions,constraints\n1,1-2-3,5\n";
    let files = Files::new(NODES, FUNCTIONS, apps, REQUESTS);
    assert!(matches!(load_error(&files), LoadError::List(_)));
}

#[test]
fn test_malformed_list_rejected() {
    let apps = "appID,functions,constraints\n1,1-x,5\n";
    let files = Files::new(NODES, FUNCTIONS, apps, REQUESTS);
    assert!(matches!(load_error(&files), LoadError::List(_)));
}

#[test]
fn test_request_for_unknown_app_rejected() {
    let requests = "time,reqID,dc,appID,revenue\n0,1,0,7,10\n";
    let files = Files::new(NODES, FUNCTIONS, APPS, requests);
    assert!(matches!(
        load_error(&files),
        LoadError::Input(InputError::UnknownApp { request: 1, app: 7 })
    ));
}

#[test]
fn test_request_outside_topology_rejected() {
    let requests = "time,reqID,dc,appID,revenue\n0,1,5,1,10\n";
    let files = Files::new(NODES, FUNCTIONS, APPS, requests);
    assert!(matches!(
        load_error(&files),
        LoadError::Input(InputError::UnknownNode { node: 5, nodes: 3 })
    ));
}

#[test]
fn test_non_numeric_csv_field_rejected() {
    let nodes = "dc,x,y,capacity,procPower\n0,0,0,8,fast\n";
    let files = Files::new(nodes, FUNCTIONS, APPS, REQUESTS);
    assert!(matches!(load_error(&files), LoadError::Csv(_)));
}

#[test]
fn test_matrix_row_length_mismatch_rejected() {
    let data = "time,src,dsts,probs\n0,0,0-1,0.5\n";
    assert!(matches!(
        parse_matrices(data.as_bytes(), 3, 1),
        Err(LoadError::Input(InputError::ProbabilityRowMismatch { row: 0, got: 1, expected: 2 }))
    ));
}

#[test]
fn test_matrix_probability_above_one_rejected() {
    let data = "time,src,dsts,probs\n0,1,1-2,0.5-1.5\n";
    assert!(matches!(
        parse_matrices(data.as_bytes(), 3, 1),
        Err(LoadError::Input(InputError::ProbabilityAboveOne { row: 1, .. }))
    ));
}

#[test]
fn test_matrix_rows_fill_dense_matrix() {
    let data = "time,src,dsts,probs\n0,0,0-1,0.75-0.25\n1,2,2,1\n";
    let matrices = parse_matrices(data.as_bytes(), 3, 2).unwrap();
    assert_eq!(matrices.len(), 2);
    assert_eq!(matrices[0][0], vec![0.75, 0.25, 0.0]);
    assert_eq!(matrices[1][2], vec![0.0, 0.0, 1.0]);
    assert!(matrices[1][0].iter().all(|p| *p == 0.0));
}

#[test]
fn test_vector_destination_outside_topology_rejected() {
    let data = "reqID,dsts,probs\n4,0-3,0.5-0.5\n";
    assert!(matches!(
        parse_vectors(data.as_bytes(), 3),
        Err(LoadError::Input(InputError::UnknownNode { node: 3, nodes: 3 }))
    ));
}

#[test]
fn test_loaded_matrix_file_checked_against_topology() {
    let files = Files::new(NODES, FUNCTIONS, APPS, REQUESTS);
    fs::write(
        files.dir.path().join("matrices.csv"),
        "time,src,dsts,probs\n0,0,0-1,0.5-2.0\n",
    )
    .unwrap();
    let extra = format!("\n[mobility]\nmatrices_path = '{}'\n", files.path("matrices.csv"));
    assert!(matches!(
        load_inputs(&files.config(&extra), 42),
        Err(LoadError::Input(InputError::ProbabilityAboveOne { .. }))
    ));
}

#[test]
fn test_non_contiguous_pairs_rejected() {
    let functions = (1..=3).map(|id| Function { id, size: 1 }).collect();
    let rows = [
        PairRow { app: 1, pair: 1, from: 1, to: 2, budget: 5 },
        PairRow { app: 1, pair: 3, from: 2, to: 3, budget: 5 },
    ];
    assert!(matches!(
        Catalog::new(functions).with_pairs(&rows),
        Err(InputError::NonContiguousPairs { app: 1, .. })
    ));
}

fn synthetic(extra: &str) -> SimConfig {
    SimConfig::from_str(&format!(
        "[run]\nduration = 4\n\n[topology]\nnodes = 6\ngrid_width = 3\n\n[requests]\nusers = 8\n{extra}"
    ))
    .unwrap()
}

#[test]
fn test_synthetic_inputs_repeat_per_seed() {
    let config = synthetic("");
    let a = load_inputs(&config, 5).unwrap();
    let b = load_inputs(&config, 5).unwrap();
    assert_eq!(a.intervals, b.intervals);
    assert_eq!(a.mobility.matrices, b.mobility.matrices);
    assert_eq!(a.catalog.apps.len(), b.catalog.apps.len());
}

#[test]
fn test_synthetic_requests_stay_inside_topology() {
    let inputs = load_inputs(&synthetic(""), 9).unwrap();
    assert_eq!(inputs.intervals.len(), 4);
    for (t, list) in inputs.intervals.iter().enumerate() {
        for r in list {
            assert_eq!(r.time as usize, t);
            assert!(r.location < 6);
            assert!(inputs.catalog.app(r.app).is_some());
        }
    }
}

#[test]
fn test_utilization_rebases_capacities() {
    let mut config = synthetic("");
    config.topology.utilization = 0.5;
    let inputs = load_inputs(&config, 3).unwrap();
    let expected = (inputs.mean_demand() / 0.5 / 6.0) as u32;
    for id in 0..6 {
        assert_eq!(inputs.topology.node(id).capacity(), expected);
        assert_eq!(inputs.topology.node(id).original_capacity(), expected);
    }
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sfcsim.toml");
    fs::write(&path, "[run]\nname = \"from-file\"\nduration = 2\n").unwrap();
    let config = SimConfig::from_file(&path).unwrap();
    assert_eq!(config.run.name, "from-file");
    assert_eq!(config.run.duration, 2);
}
