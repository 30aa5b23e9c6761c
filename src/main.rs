//! CLI entry point for litharvest.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use litharvest::{Config, Pipeline};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

/// How long an interrupted run waits for browsers to close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // RUST_LOG wins over -q / -v
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.default_log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let mut config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply_to(&mut config);
    let pipeline = Pipeline::from_config(&config)?;

    info!(query = %args.query, start_day = args.start_day, lookback_days = args.lookback_days, "litharvest starting");

    let mut run = Box::pin(pipeline.search_and_resolve(
        &args.query,
        args.start_day,
        args.lookback_days,
        args.max_records(),
    ));
    let outcome = tokio::select! {
        report = &mut run => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(report) = outcome else {
        warn!("interrupted, cancelling in-flight work");
        // Dropping the run aborts resolution tasks; their browsers close in the background.
        drop(run);
        if !pipeline.shutdown(SHUTDOWN_GRACE).await {
            warn!("exiting with browsers still closing");
        }
        return Ok(());
    };
    let report = report?;

    info!(
        found = report.stats.found,
        classified = report.stats.classified,
        included = report.stats.included,
        resolved = report.stats.resolved,
        ingested = report.stats.ingested,
        "run complete"
    );

    let json = serde_json::to_vec_pretty(&report.records)?;
    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), records = report.records.len(), "records written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&json)?;
            stdout.write_all(b"\n")?;
        }
    }

    Ok(())
}
