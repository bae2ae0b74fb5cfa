//! Binary entry point for the replica controller.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use clap::Parser;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use replica_controller::{
    ClusterSnapshot, ConfigError, ControllerConfig, ModelError, ObjectKey, ReplicaReconciler,
    RunOutcome, RunReport, Runner, SnapshotError,
};

mod cli;

use cli::{Cli, ReplayCommand};

/// Exit status when at least one attachment did not settle.
const UNSETTLED_EXIT_CODE: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Key(#[from] ModelError),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Replay(command) => replay(command).await,
        Cli::CheckConfig => check_config(io::stdout()),
    }
}

fn load_config() -> Result<ControllerConfig, CliError> {
    let config = ControllerConfig::load_without_cli_args()?;
    config.validate()?;
    Ok(config)
}

fn check_config(mut target: impl Write) -> Result<i32, CliError> {
    let config = load_config()?;
    let rendered = serde_json::to_string_pretty(&config)
        .map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(target, "{rendered}").map_err(|err| CliError::Output(err.to_string()))?;
    Ok(0)
}

async fn replay(args: ReplayCommand) -> Result<i32, CliError> {
    let config = load_config()?;
    let snapshot = ClusterSnapshot::load(Utf8Path::new(&args.snapshot))?;
    let keys = resolve_keys(&args.keys, &snapshot)?;

    let (seeded_store, seeded_capacity) = snapshot.seed();
    let store = Arc::new(seeded_store);
    let capacity = Arc::new(seeded_capacity);
    let reconciler = Arc::new(ReplicaReconciler::new(
        Arc::clone(&store),
        Arc::clone(&capacity),
        config.reconciler_settings(),
    ));
    let runner = Runner::new(Arc::clone(&reconciler), config.backoff(), args.max_attempts);

    info!(keys = keys.len(), "replaying snapshot");
    let reports = runner.drive_all(keys).await;
    if args.settle_secs > 0 {
        tokio::time::sleep(Duration::from_secs(args.settle_secs)).await;
    }
    let pending = reconciler.gc().pending_count();
    if pending > 0 {
        warn!(pending, "replica cleanup still pending; raise --settle-secs to let it fire");
    }

    let result = ClusterSnapshot::capture(&store, &capacity);
    match args.output {
        Some(path) => result.save(Utf8Path::new(&path))?,
        None => {
            let rendered = result.to_json()?;
            writeln!(io::stdout(), "{rendered}")
                .map_err(|err| CliError::Output(err.to_string()))?;
        }
    }
    write_summary(io::stderr(), &reports)?;

    if reports.iter().all(RunReport::settled) {
        Ok(0)
    } else {
        Ok(UNSETTLED_EXIT_CODE)
    }
}

fn resolve_keys(raw: &[String], snapshot: &ClusterSnapshot) -> Result<Vec<ObjectKey>, CliError> {
    if raw.is_empty() {
        return Ok(snapshot.attachment_keys());
    }
    raw.iter()
        .map(|value| value.parse::<ObjectKey>().map_err(CliError::from))
        .collect()
}

fn write_summary(mut target: impl Write, reports: &[RunReport]) -> Result<(), CliError> {
    for run in reports {
        let verdict = match &run.outcome {
            RunOutcome::Settled => String::from("settled"),
            RunOutcome::Terminal(err) => format!("failed: {err}"),
            RunOutcome::Exhausted(Some(err)) => format!("gave up: {err}"),
            RunOutcome::Exhausted(None) => String::from("gave up while waiting to requeue"),
        };
        writeln!(target, "{} after {} attempt(s): {verdict}", run.key, run.attempts)
            .map_err(|err| CliError::Output(err.to_string()))?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
