//! Lightning Merge CLI
//!
//! Generates two synthetic tables, merges them and prints the merge report as JSON.

use clap::Parser;
use lightning_merge::logging::init_logging;
use lightning_merge::metrics::gather_metrics;
use lightning_merge::{
    merge_with_config, Column, ConfigPreset, MergeConfig, MergeMethod, MergeRequest, Table,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(name = "lightning-merge")]
#[command(about = "Merge synthetic partitioned tables and report how it went", version)]
struct Cli {
    /// Rows in the left table
    #[arg(long, default_value = "1000000")]
    left_rows: usize,

    /// Rows in the right table
    #[arg(long, default_value = "250000")]
    right_rows: usize,

    /// Distinct key values
    #[arg(long, default_value = "100000")]
    keys: i64,

    /// Fraction of left rows sharing one hot key (0.0-1.0)
    #[arg(long, default_value = "0.0")]
    skew: f64,

    /// Fraction of missing keys on both sides (0.0-1.0)
    #[arg(long, default_value = "0.0")]
    missing: f64,

    /// Rows per input chunk
    #[arg(long, default_value = "65536")]
    chunk_rows: usize,

    /// Merge method (auto, radix, hash)
    #[arg(short, long, default_value = "auto")]
    method: MergeMethod,

    /// Keep every left row
    #[arg(long)]
    all_x: bool,

    /// Keep every right row
    #[arg(long)]
    all_y: bool,

    /// Configuration preset (default, low-latency, large-join)
    #[arg(long, default_value = "default")]
    preset: String,

    /// JSON configuration file, overrides the preset
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Print Prometheus metrics after the report
    #[arg(long)]
    metrics: bool,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.json_logs);

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(&cli)?;
    if let Some(workers) = cli.workers {
        config.worker_count = workers;
    }
    config.validate()?;

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let left = synthetic_table(&mut rng, &cli, cli.left_rows, cli.skew, "left_value")?;
    let right = synthetic_table(&mut rng, &cli, cli.right_rows, 0.0, "right_value")?;

    let request = MergeRequest::on(["key"])
        .all_x(cli.all_x)
        .all_y(cli.all_y)
        .method(cli.method);
    let output = merge_with_config(&left, &right, &request, config)?;

    println!("{}", serde_json::to_string_pretty(&output.report)?);
    if cli.metrics {
        println!("{}", gather_metrics()?);
    }
    Ok(())
}

fn load_config(cli: &Cli) -> lightning_merge::Result<MergeConfig> {
    if let Some(path) = &cli.config {
        return MergeConfig::from_file(path);
    }
    let preset = match cli.preset.as_str() {
        "default" => ConfigPreset::Default,
        "low-latency" => ConfigPreset::LowLatency,
        "large-join" => ConfigPreset::LargeJoin,
        other => {
            return Err(lightning_merge::Error::Config(format!(
                "unknown preset '{}'",
                other
            )))
        }
    };
    preset.to_config().with_env_overrides()
}

fn synthetic_table(
    rng: &mut StdRng,
    cli: &Cli,
    rows: usize,
    skew: f64,
    value_column: &str,
) -> lightning_merge::Result<Table> {
    let keys: Vec<Option<i64>> = (0..rows)
        .map(|_| {
            if rng.random_bool(cli.missing.clamp(0.0, 1.0)) {
                None
            } else if rng.random_bool(skew.clamp(0.0, 1.0)) {
                Some(0)
            } else {
                Some(rng.random_range(0..cli.keys.max(1)))
            }
        })
        .collect();
    let values: Vec<Option<f64>> = (0..rows).map(|_| Some(rng.random::<f64>() * 1000.0)).collect();

    Table::with_chunk_rows(
        vec![Column::int64("key", keys), Column::float64(value_column, values)],
        cli.chunk_rows,
    )
}
