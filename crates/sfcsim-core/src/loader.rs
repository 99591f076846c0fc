//! Input loading for sfcsim.
//!
//! Every input category is either read from CSV or synthesized:
//!
//! | Category | CSV header |
//! |----------|------------|
//! | nodes | `dc,x,y,capacity,procPower` (empty capacity uses the configured one) |
//! | functions | `id,size` |
//! | apps | `appID,functions,constraints[,size]` with `-`-separated lists |
//! | requests | `time,reqID,dc,appID,revenue` |
//! | matrices | `time,src,dsts,probs` with `-`-separated lists |
//! | per-user vectors | `reqID,dsts,probs` |
//!
//! Prediction matrices that are not given are derived from the realized
//! requests, so any mix of loaded and synthetic categories stays coherent.

use crate::config::SimConfig;
use crate::generator;
use crate::mobility::{self, MobilityModel, ProbMatrix};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use sfcsim_placement::{
    Catalog, Function, InputError, NodeId, NodeSpec, PairRow, Request, RequestId, Topology,
};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read input file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("Malformed list '{0}'")]
    List(String),
    #[error("Invalid distribution parameter: {0}")]
    Distribution(String),
    #[error(transparent)]
    Input(#[from] InputError),
}

/// Everything a replicate needs before its first interval.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub topology: Topology,
    pub catalog: Catalog,
    /// Realized requests per interval, `0..duration`.
    pub intervals: Vec<Vec<Request>>,
    pub mobility: MobilityModel,
}

impl Inputs {
    pub fn requests(&self, t: usize) -> &[Request] {
        self.intervals.get(t).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mean total chain size demanded per interval.
    pub fn mean_demand(&self) -> f64 {
        if self.intervals.is_empty() {
            return 0.0;
        }
        let total: u32 = self
            .intervals
            .iter()
            .flatten()
            .filter_map(|r| self.catalog.app(r.app))
            .map(|app| app.total_size())
            .sum();
        total as f64 / self.intervals.len() as f64
    }
}

#[derive(Debug, Deserialize)]
struct NodeRow {
    dc: NodeId,
    x: i64,
    y: i64,
    capacity: Option<u32>,
    #[serde(rename = "procPower")]
    proc_power: u32,
}

#[derive(Debug, Deserialize)]
struct FunctionRow {
    id: u32,
    size: u32,
}

#[derive(Debug, Deserialize)]
struct AppRow {
    #[serde(rename = "appID")]
    app_id: u32,
    functions: String,
    constraints: String,
}

#[derive(Debug, Deserialize)]
struct RequestRow {
    time: u32,
    #[serde(rename = "reqID")]
    req_id: RequestId,
    dc: NodeId,
    #[serde(rename = "appID")]
    app_id: u32,
    revenue: u32,
}

#[derive(Debug, Deserialize)]
struct MatrixRow {
    time: usize,
    src: NodeId,
    dsts: String,
    probs: String,
}

#[derive(Debug, Deserialize)]
struct VectorRow {
    #[serde(rename = "reqID")]
    req_id: RequestId,
    dsts: String,
    probs: String,
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader)
}

fn open(path: &str) -> Result<File, LoadError> {
    File::open(Path::new(path)).map_err(|source| LoadError::Io {
        path: path.to_string(),
        source,
    })
}

fn split_list<T: std::str::FromStr>(field: &str) -> Result<Vec<T>, LoadError> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split('-')
        .map(|s| s.trim().parse::<T>().map_err(|_| LoadError::List(field.to_string())))
        .collect()
}

/// Parse node specs; `capacity`, `state_cost` fill in missing values.
pub fn parse_nodes<R: Read>(
    reader: R,
    capacity: u32,
    state_cost: u32,
) -> Result<Vec<NodeSpec>, LoadError> {
    let mut specs = Vec::new();
    for row in csv_reader(reader).deserialize() {
        let row: NodeRow = row?;
        specs.push(NodeSpec {
            id: row.dc,
            x: row.x,
            y: row.y,
            capacity: row.capacity.unwrap_or(capacity),
            processing_rate: row.proc_power,
            state_cost,
        });
    }
    specs.sort_by_key(|s| s.id);
    Ok(specs)
}

pub fn parse_functions<R: Read>(reader: R) -> Result<Vec<Function>, LoadError> {
    let mut functions = Vec::new();
    for row in csv_reader(reader).deserialize() {
        let row: FunctionRow = row?;
        functions.push(Function {
            id: row.id,
            size: row.size,
        });
    }
    Ok(functions)
}

/// Parse chains into pair rows: `functions = 1-2-3` with
/// `constraints = 5-7` yields pairs (1,2,5) and (2,3,7).
pub fn parse_apps<R: Read>(reader: R) -> Result<Vec<PairRow>, LoadError> {
    let mut rows = Vec::new();
    for row in csv_reader(reader).deserialize() {
        let row: AppRow = row?;
        let functions: Vec<u32> = split_list(&row.functions)?;
        let budgets: Vec<u32> = split_list(&row.constraints)?;
        if functions.len() < 2 {
            return Err(InputError::ChainTooShort { app: row.app_id }.into());
        }
        if budgets.len() != functions.len() - 1 {
            return Err(LoadError::List(format!(
                "{} has {} constraints for {} functions",
                row.app_id,
                budgets.len(),
                functions.len()
            )));
        }
        for (i, (pair, budget)) in functions.windows(2).zip(budgets).enumerate() {
            rows.push(PairRow {
                app: row.app_id,
                pair: i as u32 + 1,
                from: pair[0],
                to: pair[1],
                budget,
            });
        }
    }
    Ok(rows)
}

/// Parse realized requests into `duration` per-interval lists. Rows past
/// the duration are ignored.
pub fn parse_requests<R: Read>(reader: R, duration: usize) -> Result<Vec<Vec<Request>>, LoadError> {
    let mut intervals = vec![Vec::new(); duration];
    for row in csv_reader(reader).deserialize() {
        let row: RequestRow = row?;
        if let Some(list) = intervals.get_mut(row.time as usize) {
            list.push(Request::new(row.req_id, row.time, row.app_id, row.dc, row.revenue));
        }
    }
    Ok(intervals)
}

/// Parse sparse matrix rows into `duration` dense `nodes x nodes` matrices.
pub fn parse_matrices<R: Read>(
    reader: R,
    nodes: usize,
    duration: usize,
) -> Result<Vec<ProbMatrix>, LoadError> {
    let mut matrices = vec![vec![vec![0.0; nodes]; nodes]; duration.max(1)];
    for row in csv_reader(reader).deserialize() {
        let row: MatrixRow = row?;
        let Some(matrix) = matrices.get_mut(row.time) else {
            continue;
        };
        let row_values = matrix
            .get_mut(row.src)
            .ok_or(InputError::UnknownNode { node: row.src, nodes })?;
        fill_row(row_values, row.src, &row.dsts, &row.probs, nodes)?;
    }
    Ok(matrices)
}

pub fn parse_vectors<R: Read>(
    reader: R,
    nodes: usize,
) -> Result<BTreeMap<RequestId, Vec<f64>>, LoadError> {
    let mut vectors = BTreeMap::new();
    for row in csv_reader(reader).deserialize() {
        let row: VectorRow = row?;
        let mut values = vec![0.0; nodes];
        fill_row(&mut values, row.req_id as usize, &row.dsts, &row.probs, nodes)?;
        vectors.insert(row.req_id, values);
    }
    Ok(vectors)
}

fn fill_row(
    values: &mut [f64],
    row: usize,
    dsts: &str,
    probs: &str,
    nodes: usize,
) -> Result<(), LoadError> {
    let dsts: Vec<NodeId> = split_list(dsts)?;
    let probs: Vec<f64> = split_list(probs)?;
    if dsts.len() != probs.len() {
        return Err(InputError::ProbabilityRowMismatch {
            row,
            got: probs.len(),
            expected: dsts.len(),
        }
        .into());
    }
    for (dst, p) in dsts.into_iter().zip(probs) {
        if p > 1.0 {
            return Err(InputError::ProbabilityAboveOne { row, value: p }.into());
        }
        let slot = values
            .get_mut(dst)
            .ok_or(InputError::UnknownNode { node: dst, nodes })?;
        *slot = p;
    }
    Ok(())
}

/// Assemble the inputs of one replicate, reading what `config` points at
/// and synthesizing the rest from `seed`.
pub fn load_inputs(config: &SimConfig, seed: u64) -> Result<Inputs, LoadError> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let duration = config.run.duration as usize;
    let topo_cfg = &config.topology;

    let specs = match &topo_cfg.nodes_path {
        Some(path) => parse_nodes(open(path)?, topo_cfg.capacity, topo_cfg.state_cost)?,
        None => generator::grid_nodes(topo_cfg),
    };
    let mut topology = Topology::ranged(
        &specs,
        topo_cfg.allowed_range,
        topo_cfg.link_delay,
        topo_cfg.link_bandwidth,
    )?;

    let functions = match &config.functions.path {
        Some(path) => parse_functions(open(path)?)?,
        None => generator::functions(&config.functions, &mut rng)?,
    };
    let pair_rows = match &config.apps.path {
        Some(path) => parse_apps(open(path)?)?,
        None => generator::apps(&config.apps, &functions, &mut rng)?,
    };
    let catalog = Catalog::new(functions).with_pairs(&pair_rows)?;

    let intervals = match &config.requests.path {
        Some(path) => parse_requests(open(path)?, duration)?,
        None => generator::user_walks(config, &topology, &catalog, &mut rng)?,
    };
    for (t, list) in intervals.iter().enumerate() {
        catalog.check_requests(list)?;
        if let Some(r) = list.iter().find(|r| r.location >= topology.len()) {
            return Err(InputError::UnknownNode {
                node: r.location,
                nodes: topology.len(),
            }
            .into());
        }
        if list.iter().any(|r| r.time as usize != t) {
            return Err(LoadError::List(format!("interval {} holds foreign requests", t)));
        }
    }

    let n = topology.len();
    let mob_cfg = &config.mobility;
    let raw = match &mob_cfg.matrices_path {
        Some(path) => parse_matrices(open(path)?, n, duration)?,
        None => generator::empirical_matrices(&intervals, n),
    };
    let matrices = mobility::prepare(
        raw,
        mob_cfg.prediction_threshold,
        config.requests.predictions_per_request,
        mob_cfg.merge_intervals,
    );
    let per_user = match (&mob_cfg.per_user_path, mob_cfg.levy_walk) {
        (Some(path), _) => parse_vectors(open(path)?, n)?,
        (None, true) => generator::visit_frequencies(&intervals, n),
        (None, false) => BTreeMap::new(),
    };
    let coverage = match &mob_cfg.coverage_path {
        Some(path) => {
            let mut m = parse_matrices(open(path)?, n, 1)?.swap_remove(0);
            mobility::apply_threshold(&mut m, mob_cfg.heuristic_threshold);
            Some(m)
        }
        None => None,
    };
    let mobility = MobilityModel {
        matrices,
        per_user,
        coverage,
    };
    mobility.validate(n)?;

    let mut inputs = Inputs {
        topology: topology.clone(),
        catalog,
        intervals,
        mobility,
    };
    if topo_cfg.utilization > 0.0 && n > 0 {
        let capacity = (inputs.mean_demand() / topo_cfg.utilization / n as f64) as u32;
        topology.rebase_capacities(capacity);
        inputs.topology = topology;
        info!(capacity, utilization = topo_cfg.utilization, "rebased node capacities");
    }

    info!(
        nodes = n,
        functions = inputs.catalog.functions.len(),
        apps = inputs.catalog.apps.len(),
        requests = inputs.intervals.iter().map(Vec::len).sum::<usize>(),
        seed,
        "inputs ready"
    );
    Ok(inputs)
}
