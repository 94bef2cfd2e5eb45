//! batchwise CLI - run JSONL pipelines and manage checkpoints.

use anyhow::{bail, Context, Result};
use batchwise::checkpoint::CheckpointStore;
use batchwise::{Config, ExecutionEngine, FnStep, WorkUnit};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "batchwise")]
#[command(version)]
#[command(about = "Resilient batch execution with adaptive sizing, retry and checkpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "batchwise.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a JSONL file through the pipeline
    Run {
        /// Input JSONL file, one row per line
        #[arg(short, long)]
        input: PathBuf,

        /// Output JSONL file
        #[arg(short, long)]
        output: PathBuf,

        /// Drop object rows that contain a null field
        #[arg(long)]
        drop_nulls: bool,

        /// Resume after the latest checkpoint of this pipeline
        #[arg(long)]
        resume: bool,

        /// Print the metrics snapshot as JSON
        #[arg(long)]
        metrics: bool,
    },

    /// Inspect and maintain checkpoints
    Checkpoints {
        /// Checkpoint root (defaults to the configured root)
        #[arg(long)]
        root: Option<PathBuf>,

        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints, newest first
    List {
        /// Only this pipeline
        #[arg(short, long)]
        pipeline: Option<String>,
    },

    /// Show one checkpoint's metadata and state size
    Show { id: String },

    /// Delete one checkpoint
    Delete { id: String },

    /// Keep only the newest checkpoints of a pipeline
    Prune {
        pipeline: String,

        #[arg(short, long, default_value = "5")]
        keep_last: usize,
    },

    /// Remove leftovers of interrupted writes
    Sweep,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# batchwise configuration file

[pipeline]
name = "orders"
failure_policy = "fail_run"      # or "skip_failed_units"
resume = false

[sizing]
strategy = "adaptive"            # "adaptive", "memory_bounded" or "fixed"
initial_batch_size = 1000
min_batch_size = 100
max_batch_size = 10000
target_duration_ms = 1000
memory_ceiling_mb = 512
sample_rows = 1000

[dispatch]
mode = "sequential"              # or "parallel"
# workers = 8                    # defaults to available parallelism
execution = "shared"             # or "isolated"

[retry]
max_attempts = 3
initial_delay_ms = 1000
backoff_factor = 2.0
max_delay_ms = 60000
retryable = ["transient", "timeout", "io"]

[checkpoint]
enabled = true
root = "${HOME}/.batchwise/checkpoints"
keep_last = 5
"#;
    println!("{example}");
}

/// Config from `path`, or defaults when the file does not exist.
fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
    } else {
        Ok(Config::default())
    }
}

fn read_rows(path: &Path) -> Result<Vec<Value>> {
    let file = File::open(path).with_context(|| format!("Failed to open {path:?}"))?;
    let mut rows = Vec::new();

    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {path:?}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: Value = serde_json::from_str(&line)
            .with_context(|| format!("Line {}: invalid JSON", line_num + 1))?;
        rows.push(row);
    }

    info!(count = rows.len(), "Loaded rows");
    Ok(rows)
}

fn write_rows(path: &Path, rows: &[Value]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {path:?}"))?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writeln!(writer)?;
    }
    writer.flush().context("Failed to flush output")?;
    Ok(())
}

fn has_null_field(row: &Value) -> bool {
    match row {
        Value::Object(map) => map.values().any(Value::is_null),
        Value::Null => true,
        _ => false,
    }
}

async fn run_pipeline(
    config: Config,
    input: &Path,
    output: &Path,
    drop_nulls: bool,
    show_metrics: bool,
) -> Result<()> {
    let rows = read_rows(input)?;

    let mut engine = ExecutionEngine::new(config)?.with_step(FnStep::new(
        "load",
        |unit: &WorkUnit<Value>| -> batchwise::Result<Vec<Value>> { Ok(unit.rows.to_vec()) },
    ));
    if drop_nulls {
        engine.add_step(FnStep::new(
            "drop_nulls",
            |unit: &WorkUnit<Value>| -> batchwise::Result<Vec<Value>> {
                Ok(unit.rows.iter().filter(|r| !has_null_field(r)).cloned().collect())
            },
        ));
    }

    let report = engine.run(rows).await?;

    println!("\n=== Pipeline {} ===", report.pipeline);
    println!("Status:      {:?}", report.status);
    println!("Rows in:     {}", report.rows_in);
    println!("Rows out:    {}", report.rows_processed);
    println!("Steps:       {}", report.steps_completed.join(", "));
    if let Some(step) = &report.resumed_from {
        println!("Resumed:     after {step}");
    }
    println!("Failed units: {}", report.failed_units);
    println!("Checkpoints: {}", report.checkpoints.len());
    println!("Runtime:     {:.2}s", report.duration_secs);

    if show_metrics {
        println!("{}", serde_json::to_string_pretty(&engine.metrics())?);
    }

    if let Some(error) = &report.error {
        bail!("Pipeline failed: {error}");
    }

    let rows = engine.take_output().unwrap_or_default();
    write_rows(output, &rows)?;
    println!("Output:      {output:?}");
    Ok(())
}

fn checkpoints(store: &CheckpointStore, action: CheckpointAction) -> Result<()> {
    match action {
        CheckpointAction::List { pipeline } => {
            let entries = store.list(pipeline.as_deref())?;
            if entries.is_empty() {
                println!("No checkpoints in {:?}", store.root());
            }
            for meta in entries {
                println!(
                    "{}  {}  {:<16} step {:>2} {:<16} {} bytes",
                    meta.id,
                    meta.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    meta.pipeline,
                    meta.step_index,
                    meta.step,
                    meta.state_bytes
                );
            }
        }

        CheckpointAction::Show { id } => {
            let checkpoint = store
                .load::<Value>(&id)
                .with_context(|| format!("Failed to load checkpoint {id}"))?;
            println!("{}", serde_json::to_string_pretty(&checkpoint.metadata)?);
            if let Value::Array(rows) = &checkpoint.state {
                println!("State rows:  {}", rows.len());
            }
        }

        CheckpointAction::Delete { id } => {
            store.delete(&id)?;
            println!("Deleted {id}");
        }

        CheckpointAction::Prune {
            pipeline,
            keep_last,
        } => {
            if keep_last == 0 {
                bail!("--keep-last must be at least 1");
            }
            let removed = store.prune(&pipeline, keep_last)?;
            println!("Removed {removed} checkpoint(s) of {pipeline}");
        }

        CheckpointAction::Sweep => {
            let removed = store.sweep()?;
            if removed > 0 {
                warn!(removed, "Removed leftovers of interrupted writes");
            }
            println!("Removed {removed} file(s)");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = Config::from_file(&cli.config)
                .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

            info!("Configuration is valid");
            info!("  Pipeline: {} ({:?})", config.pipeline.name, config.pipeline.failure_policy);
            info!(
                "  Sizing: {:?}, {} in [{}, {}]",
                config.sizing.strategy,
                config.sizing.initial_batch_size,
                config.sizing.min_batch_size,
                config.sizing.max_batch_size
            );
            info!(
                "  Dispatch: {:?} with {} workers ({:?})",
                config.dispatch.mode,
                config.dispatch.worker_count(),
                config.dispatch.execution
            );
            info!(
                "  Retry: {} attempts, delays {:?}",
                config.retry.max_attempts,
                batchwise::RetryPolicy::new(&config.retry)?.delay_schedule()
            );
            info!("  Checkpoints: {:?}", config.checkpoint.resolved_root());
        }

        Commands::Run {
            input,
            output,
            drop_nulls,
            resume,
            metrics,
        } => {
            let mut config = load_config_or_default(&cli.config)?;
            config.pipeline.resume |= resume;
            run_pipeline(config, &input, &output, drop_nulls, metrics).await?;
        }

        Commands::Checkpoints { root, action } => {
            let root = match root {
                Some(root) => root,
                None => load_config_or_default(&cli.config)?.checkpoint.resolved_root(),
            };
            let store = CheckpointStore::new(&root)
                .with_context(|| format!("Failed to open checkpoint root {root:?}"))?;
            checkpoints(&store, action)?;
        }
    }

    Ok(())
}
