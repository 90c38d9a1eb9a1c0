//! `glowtune` - prepare, run and inspect hyperparameter searches.

mod evaluators;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gt_engine::{checkout, prepare, serve, Run, RunOptions, WorkerCommand};
use gt_types::RunConfig;

#[derive(Debug, Parser)]
#[command(name = "glowtune", version, about = "Restartable hyperparameter search")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a run directory from a JSON run config
    Prepare(PrepareArgs),
    /// Start or resume the run in a directory
    Run(RunArgs),
    /// Print the state of a run without modifying it
    Checkout(CheckoutArgs),
    /// Serve evaluations over stdin/stdout (spawned by `run`)
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args)]
struct PrepareArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    dir: PathBuf,
    /// Replace an existing run in DIR
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Stop scheduling new trials after this many seconds
    #[arg(long)]
    time_budget_secs: Option<f64>,
    #[arg(long, default_value_t = 10.0)]
    status_interval_secs: f64,
    #[arg(long, default_value_t = 30.0)]
    drain_grace_secs: f64,
    #[arg(long, default_value_t = 10)]
    top_n: usize,
}

#[derive(Debug, Args)]
struct CheckoutArgs {
    #[arg(long)]
    dir: PathBuf,
    #[arg(long, default_value_t = 10)]
    top_n: usize,
    /// Print the top trials as JSON instead of the text report
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Worker => "warn",
        _ => "info",
    };
    // stdout belongs to the worker protocol and to command output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Prepare(args) => prepare_command(args),
        Commands::Checkout(args) => checkout_command(args),
        Commands::Worker => worker_command(),
        Commands::Run(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run_command(args))
        }
    }
}

fn prepare_command(args: PrepareArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: RunConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", args.config.display()))?;
    let meta = prepare(&args.dir, config, args.force)?;
    println!("{}", meta.run_id);
    Ok(())
}

fn checkout_command(args: CheckoutArgs) -> Result<()> {
    let checkout = checkout(&args.dir)?;
    let snapshot = checkout.snapshot(args.top_n);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot.top)?);
    } else {
        print!("{}", snapshot.render());
    }
    Ok(())
}

fn worker_command() -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(
        &evaluators::build_evaluator,
        BufReader::new(stdin.lock()),
        stdout.lock(),
    )?;
    Ok(())
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{flag} must be a non-negative number"))
}

async fn run_command(args: RunArgs) -> Result<()> {
    let time_budget = args
        .time_budget_secs
        .map(|secs| seconds(secs, "--time-budget-secs"))
        .transpose()?;
    let options = RunOptions::new(WorkerCommand::current_exe()?)
        .with_max_workers(args.workers)
        .with_time_budget(time_budget)
        .with_status_interval(seconds(args.status_interval_secs, "--status-interval-secs")?)
        .with_drain_grace(seconds(args.drain_grace_secs, "--drain-grace-secs")?)
        .with_top_n(args.top_n);

    let run = Run::restore(&args.dir, options).await?;
    info!(
        run = %run.meta().config.name,
        run_id = %run.meta().run_id,
        submitted = run.state().n_submitted(),
        "run starting"
    );

    tokio::select! {
        summary = run.drive() => {
            let summary = summary?;
            println!(
                "{:?}: {} submitted ({} ok, {} errors), best loss {}",
                summary.reason,
                summary.submitted,
                summary.ok,
                summary.errors,
                summary
                    .best_loss
                    .map_or_else(|| "n/a".to_string(), |loss| format!("{loss:.6}")),
            );
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; run `glowtune run` on the same directory to resume");
            Ok(())
        }
    }
}
