//! sfcsim CLI — Run service function chain placement experiments.

use clap::Parser;
use sfcsim_core::config::SimConfig;
use sfcsim_core::metrics;
use sfcsim_core::runner::{self, Experiment};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sfcsim",
    about = "Simulate mobility-aware service function chain placement",
    version
)]
struct Cli {
    /// Experiment type: 0 = mispredict-rate sweep, 2 = setup-cost sweep,
    /// 3 = utilization sweep.
    experiment: u32,
    /// Path to TOML configuration file.
    #[arg(short, long, default_value = "sfcsim.toml")]
    config: PathBuf,
    /// Output per-run summaries to a JSON file.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let Some(experiment) = Experiment::from_code(cli.experiment) else {
        eprintln!(
            "Unknown experiment: {}. Available: 0 (mispredict rate), 2 (setup cost), 3 (utilization)",
            cli.experiment
        );
        std::process::exit(1);
    };

    let sim_config = SimConfig::from_file(&cli.config).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    });

    let default_level = if sim_config.run.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(true)
        .init();

    let report = runner::run_experiment(&sim_config, experiment).unwrap_or_else(|e| {
        eprintln!("Error running experiment {}: {}", experiment, e);
        std::process::exit(1);
    });
    let results = &report.summaries;

    println!("{}", metrics::format_comparison_table(results));
    println!(
        "Run logs written to {}",
        runner::results_root(&sim_config, experiment).display()
    );
    for failure in &report.failures {
        eprintln!("Replicate failed: {}", failure);
    }

    if let Some(output_path) = cli.output {
        let json = serde_json::to_string_pretty(results).unwrap_or_else(|e| {
            eprintln!("Error serializing results: {}", e);
            std::process::exit(1);
        });
        std::fs::write(&output_path, json).unwrap_or_else(|e| {
            eprintln!("Error writing output: {}", e);
            std::process::exit(1);
        });
        println!("Results written to {}", output_path.display());
    }

    if !report.is_complete() {
        eprintln!(
            "{} of {} replicates failed",
            report.failures.len(),
            sim_config.experiment.values.len() * sim_config.run.iterations as usize
        );
        std::process::exit(1);
    }
}
