//! Append-only CSV artifacts of one run kind.
//!
//! Each file gets its header the first time a row is written to it.

use serde::Serialize;
use sfcsim_placement::{Catalog, Request, Topology};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const PLACED_APPS: &str = "placedApps.csv";
pub const PLACED_FUNCTIONS: &str = "placedFunctions.csv";
pub const DC_UTILIZATION: &str = "dcUtilization.csv";
pub const LINK_UTILIZATION: &str = "linkUtilization.csv";
pub const ATTEMPTED_REQUESTS: &str = "attemptedRequests.csv";
pub const PREALLOC_HEURISTIC_REQUESTS: &str = "preallocHeuristicRequests.csv";
pub const STATE_COST: &str = "stateCost.csv";
pub const RUNTIME: &str = "runtime.csv";
pub const ORIGINAL_REQUESTS: &str = "originalRequests.csv";
pub const PREALLOC_REQUESTS: &str = "preallocRequests.csv";
pub const DATACENTERS: &str = "datacenters.csv";
pub const APPLICATIONS: &str = "applications.csv";
pub const FUNCTIONS: &str = "functions.csv";
pub const SUMMARY_LOG: &str = "summary.log";
pub const SUMMARY_JSON: &str = "summary.json";

#[derive(Debug, Clone, Serialize)]
pub struct PlacedAppRow {
    pub time: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "reqID")]
    pub request: u32,
    pub dc: usize,
    #[serde(rename = "appID")]
    pub app: u32,
    pub size: u32,
    pub revenue: u32,
    pub predicted: u8,
    #[serde(rename = "costPaid")]
    pub cost_paid: u32,
    pub weight: f64,
    pub redirected: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedFunctionRow {
    pub time: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "reqID")]
    pub request: u32,
    #[serde(rename = "funcID")]
    pub function: u32,
    pub dc: usize,
    pub size: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DcUtilizationRow {
    pub time: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub dc: usize,
    pub placed: u32,
    #[serde(rename = "placedDynamic")]
    pub placed_dynamic: u32,
    #[serde(rename = "staticUnused")]
    pub static_unused: u32,
    pub capacity: u32,
    pub utilization: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkUtilizationRow {
    pub time: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub src: usize,
    pub dst: usize,
    pub placed: u32,
    pub capacity: u32,
    pub utilization: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptedRequestRow {
    pub time: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "reqID")]
    pub request: u32,
    pub dc: usize,
    #[serde(rename = "appID")]
    pub app: u32,
    pub weight: f64,
    pub revenue: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrunedRequestRow {
    pub time: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "reqID")]
    pub request: u32,
    pub dc: usize,
    #[serde(rename = "appID")]
    pub app: u32,
    pub weight: f64,
    #[serde(rename = "totalWeight")]
    pub total_weight: f64,
    pub size: u32,
    pub revenue: u32,
    pub used: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateCostRow {
    pub time: u32,
    pub dc: usize,
    pub cost: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeRow {
    pub time: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub nodes: u64,
    #[serde(rename = "elapsedMs")]
    pub elapsed_ms: u128,
    #[serde(rename = "capacityRatio")]
    pub capacity_ratio: f64,
    pub requests: usize,
    pub gap: f64,
}

#[derive(Debug, Clone, Serialize)]
struct OriginalRequestRow {
    time: u32,
    #[serde(rename = "reqID")]
    request: u32,
    dc: usize,
    #[serde(rename = "appID")]
    app: u32,
    size: u32,
    revenue: u32,
}

#[derive(Debug, Clone, Serialize)]
struct PreallocRequestRow {
    time: u32,
    #[serde(rename = "reqID")]
    request: u32,
    dc: usize,
    #[serde(rename = "appID")]
    app: u32,
    weight: f64,
    #[serde(rename = "totalWeight")]
    total_weight: f64,
    size: u32,
    revenue: u32,
}

#[derive(Debug, Clone, Serialize)]
struct DatacenterRow {
    dc: usize,
    x: i64,
    y: i64,
    capacity: u32,
    #[serde(rename = "procPower")]
    proc_power: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ApplicationRow {
    #[serde(rename = "appID")]
    app: u32,
    functions: String,
    constraints: String,
    size: u32,
}

#[derive(Debug, Clone, Serialize)]
struct FunctionRow {
    id: u32,
    size: u32,
}

/// Percentage of `capacity` in use, 0 for an empty capacity.
pub fn utilization(placed: u32, capacity: u32) -> f64 {
    if capacity == 0 {
        0.0
    } else {
        placed as f64 * 100.0 / capacity as f64
    }
}

/// Writers of one `logs_<kind>` directory.
pub struct ArtifactSink {
    dir: PathBuf,
    writers: BTreeMap<&'static str, csv::Writer<File>>,
    summary: BufWriter<File>,
}

impl ArtifactSink {
    /// Create `dir` and open its summary log.
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let summary = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(SUMMARY_LOG))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            writers: BTreeMap::new(),
            summary: BufWriter::new(summary),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one row to `file`.
    pub fn write<T: Serialize>(&mut self, file: &'static str, row: &T) -> Result<(), csv::Error> {
        if !self.writers.contains_key(file) {
            let path = self.dir.join(file);
            let handle = OpenOptions::new().create(true).append(true).open(&path)?;
            let fresh = handle.metadata()?.len() == 0;
            let writer = csv::WriterBuilder::new()
                .has_headers(fresh)
                .from_writer(handle);
            self.writers.insert(file, writer);
        }
        match self.writers.get_mut(file) {
            Some(writer) => writer.serialize(row),
            None => Ok(()),
        }
    }

    /// Append a human-readable line to `summary.log`.
    pub fn note(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.summary, "{line}")
    }

    /// Dump the static tables of a run: nodes, apps and functions.
    pub fn write_inputs(&mut self, topology: &Topology, catalog: &Catalog) -> Result<(), csv::Error> {
        for node in topology.nodes() {
            self.write(
                DATACENTERS,
                &DatacenterRow {
                    dc: node.id,
                    x: node.x,
                    y: node.y,
                    capacity: node.original_capacity(),
                    proc_power: node.processing_rate,
                },
            )?;
        }
        for (id, app) in &catalog.apps {
            let functions: Vec<String> = app.functions().iter().map(u32::to_string).collect();
            let constraints: Vec<String> = app
                .pair_rows()
                .iter()
                .map(|p| p.budget.to_string())
                .collect();
            self.write(
                APPLICATIONS,
                &ApplicationRow {
                    app: *id,
                    functions: functions.join("-"),
                    constraints: constraints.join("-"),
                    size: app.total_size(),
                },
            )?;
        }
        for function in catalog.functions.values() {
            self.write(
                FUNCTIONS,
                &FunctionRow {
                    id: function.id,
                    size: function.size,
                },
            )?;
        }
        Ok(())
    }

    /// Realized requests of interval `time`.
    pub fn write_original(&mut self, time: u32, requests: &[Request], catalog: &Catalog) -> Result<(), csv::Error> {
        for r in requests {
            self.write(
                ORIGINAL_REQUESTS,
                &OriginalRequestRow {
                    time,
                    request: r.id,
                    dc: r.location,
                    app: r.app,
                    size: app_size(catalog, r),
                    revenue: r.revenue,
                },
            )?;
        }
        Ok(())
    }

    /// Weighted instances handed to a Preallocate model.
    pub fn write_prealloc(&mut self, time: u32, instances: &[Request], catalog: &Catalog) -> Result<(), csv::Error> {
        for r in instances {
            self.write(
                PREALLOC_REQUESTS,
                &PreallocRequestRow {
                    time,
                    request: r.id,
                    dc: r.location,
                    app: r.app,
                    weight: r.weight,
                    total_weight: r.total_weight,
                    size: app_size(catalog, r),
                    revenue: r.revenue,
                },
            )?;
        }
        Ok(())
    }

    /// Instances a pruning pass looked at, with their `used` flag.
    pub fn write_pruned(
        &mut self,
        time: u32,
        kind: &'static str,
        considered: &[Request],
        catalog: &Catalog,
    ) -> Result<(), csv::Error> {
        for r in considered {
            self.write(
                PREALLOC_HEURISTIC_REQUESTS,
                &PrunedRequestRow {
                    time,
                    kind,
                    request: r.id,
                    dc: r.location,
                    app: r.app,
                    weight: r.weight,
                    total_weight: r.total_weight,
                    size: app_size(catalog, r),
                    revenue: r.revenue,
                    used: r.used as u8,
                },
            )?;
        }
        Ok(())
    }

    pub fn write_attempted(&mut self, time: u32, kind: &'static str, instances: &[Request]) -> Result<(), csv::Error> {
        for r in instances {
            self.write(
                ATTEMPTED_REQUESTS,
                &AttemptedRequestRow {
                    time,
                    kind,
                    request: r.id,
                    dc: r.location,
                    app: r.app,
                    weight: r.weight,
                    revenue: r.revenue,
                },
            )?;
        }
        Ok(())
    }

    /// Node and link utilization of `topology`. `static_unused` is indexed by
    /// node and may be empty.
    pub fn write_utilization(
        &mut self,
        time: u32,
        kind: &'static str,
        topology: &Topology,
        static_unused: &[u32],
    ) -> Result<(), csv::Error> {
        for node in topology.nodes() {
            let placed = node.used();
            self.write(
                DC_UTILIZATION,
                &DcUtilizationRow {
                    time,
                    kind,
                    dc: node.id,
                    placed,
                    placed_dynamic: node.dynamic_size(),
                    static_unused: static_unused.get(node.id).copied().unwrap_or(0),
                    capacity: node.original_capacity(),
                    utilization: utilization(placed, node.original_capacity()),
                },
            )?;
        }
        for link in topology.links() {
            if link.original_bandwidth() == 0 {
                continue;
            }
            let placed = link.original_bandwidth() - link.bandwidth();
            self.write(
                LINK_UTILIZATION,
                &LinkUtilizationRow {
                    time,
                    kind,
                    src: link.src,
                    dst: link.dst,
                    placed,
                    capacity: link.original_bandwidth(),
                    utilization: utilization(placed, link.original_bandwidth()),
                },
            )?;
        }
        Ok(())
    }

    pub fn write_state_costs(&mut self, time: u32, topology: &Topology) -> Result<(), csv::Error> {
        for node in topology.nodes() {
            self.write(
                STATE_COST,
                &StateCostRow {
                    time,
                    dc: node.id,
                    cost: node.state_cost(),
                },
            )?;
        }
        Ok(())
    }

    /// Write `summary.json` next to the CSVs.
    pub fn write_summary<T: Serialize>(&self, summary: &T) -> Result<(), serde_json::Error> {
        let file = File::create(self.dir.join(SUMMARY_JSON)).map_err(serde_json::Error::io)?;
        serde_json::to_writer_pretty(BufWriter::new(file), summary)
    }

    /// Flush every open writer.
    pub fn finish(&mut self) -> std::io::Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        self.summary.flush()
    }
}

fn app_size(catalog: &Catalog, request: &Request) -> u32 {
    catalog.app(request.app).map(|a| a.total_size()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfcsim_placement::{Function, NodeSpec, PairRow};

    fn read(dir: &Path, file: &str) -> String {
        fs::read_to_string(dir.join(file)).unwrap()
    }

    #[test]
    fn test_header_written_once() {
        let tmp = tempfile::tempdir().unwrap();
        let row = StateCostRow { time: 1, dc: 0, cost: 3 };
        {
            let mut sink = ArtifactSink::create(tmp.path()).unwrap();
            sink.write(STATE_COST, &row).unwrap();
            sink.finish().unwrap();
        }
        let mut sink = ArtifactSink::create(tmp.path()).unwrap();
        sink.write(STATE_COST, &row).unwrap();
        sink.finish().unwrap();
        assert_eq!(read(tmp.path(), STATE_COST), "time,dc,cost\n1,0,3\n1,0,3\n");
    }

    #[test]
    fn test_placed_app_header() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = ArtifactSink::create(tmp.path()).unwrap();
        let row = PlacedAppRow {
            time: 2,
            kind: "Actual",
            request: 4,
            dc: 1,
            app: 3,
            size: 2,
            revenue: 90,
            predicted: 1,
            cost_paid: 0,
            weight: 1.0,
            redirected: 0,
        };
        sink.write(PLACED_APPS, &row).unwrap();
        sink.finish().unwrap();
        let content = read(tmp.path(), PLACED_APPS);
        let header = content.lines().next().unwrap();
        assert_eq!(
            header,
            "time,type,reqID,dc,appID,size,revenue,predicted,costPaid,weight,redirected"
        );
    }

    #[test]
    fn test_inputs_and_utilization_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let specs = vec![
            NodeSpec { id: 0, x: 0, y: 0, capacity: 4, processing_rate: 2, state_cost: 1 },
            NodeSpec { id: 1, x: 1, y: 0, capacity: 4, processing_rate: 2, state_cost: 1 },
        ];
        let mut topo = Topology::ranged(&specs, 1, 1, 2).unwrap();
        topo.reserve(0, 1).unwrap();
        let catalog = Catalog::new(vec![Function { id: 1, size: 1 }, Function { id: 2, size: 2 }])
            .with_pairs(&[PairRow { app: 1, pair: 1, from: 1, to: 2, budget: 6 }])
            .unwrap();
        let mut sink = ArtifactSink::create(tmp.path()).unwrap();
        sink.write_inputs(&topo, &catalog).unwrap();
        sink.write_utilization(0, "Preallocate", &topo, &[]).unwrap();
        sink.finish().unwrap();

        assert_eq!(
            read(tmp.path(), APPLICATIONS),
            "appID,functions,constraints,size\n1,1-2,6,3\n"
        );
        assert!(read(tmp.path(), DATACENTERS).starts_with("dc,x,y,capacity,procPower\n0,0,0,4,2\n"));
        let dc = read(tmp.path(), DC_UTILIZATION);
        assert!(dc.contains("0,Preallocate,0,1,0,0,4,25.0"));
        assert_eq!(read(tmp.path(), LINK_UTILIZATION).lines().count(), 3);
    }
}
