//! `conntrail run` — run the agent until SIGINT or SIGTERM.

use std::path::Path;

use anyhow::Context;
use clap::Args;
use conntrail_agent::Agent;
use tokio::signal::unix::{SignalKind, signal};

use super::load_config;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Override the conntrack sampling interval, in milliseconds.
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

async fn wait_for_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            None
        }
    };
    let terminated = async {
        match terminate.as_mut() {
            Some(stream) => {
                let _ = stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        () = interrupted => tracing::info!(signal = "SIGINT", "stopping"),
        () = terminated => tracing::info!(signal = "SIGTERM", "stopping"),
    }
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, connection tracking is
/// unavailable, no sink can be started, or the source fails persistently.
pub fn execute(config_path: &Path, args: &RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(interval) = args.poll_interval_ms {
        config.source.poll_interval_ms = interval;
        config.validate()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;
    let report = runtime.block_on(Agent::new(config).run(wait_for_signal()))?;

    for sink in &report.sinks {
        if sink.abandoned > 0 {
            tracing::warn!(sink = %sink.name, abandoned = sink.abandoned, "undelivered events discarded");
        }
    }
    tracing::info!(emitted = report.pipeline.emitted, "conntrail stopped");
    Ok(())
}
