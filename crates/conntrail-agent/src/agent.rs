//! Agent lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use conntrail_common::config::AgentConfig;
use conntrail_dispatch::{Dispatcher, Sink, SinkReport, sinks};
use conntrail_track::filter::FilterContext;
use conntrail_track::source::ConntrackSource;
use serde::Serialize;

use crate::error::{AgentError, Result};
use crate::pipeline::{Pipeline, PipelineCounters};

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    /// Ingestion counters.
    pub pipeline: PipelineCounters,
    /// Per-sink delivery results.
    pub sinks: Vec<SinkReport>,
}

async fn build_sinks(config: &AgentConfig) -> Result<Vec<Box<dyn Sink>>> {
    let timeout = config.dispatch.delivery_timeout();
    let mut built = Vec::with_capacity(config.sinks.len());
    for target in &config.sinks {
        match sinks::connect(target, timeout).await {
            Ok(sink) => {
                tracing::info!(sink = sink.name(), "sink ready");
                built.push(sink);
            }
            Err(e) => tracing::error!(sink = %target.display_name(), error = %e, "sink failed to start, skipping"),
        }
    }
    if built.is_empty() {
        return Err(AgentError::NoSinks {
            configured: config.sinks.len(),
        });
    }
    Ok(built)
}

async fn filter_context(config: &AgentConfig) -> FilterContext {
    let mut sink_endpoints = Vec::new();
    for target in config.sinks.iter().filter(|t| t.is_network_bound()) {
        sink_endpoints.extend(sinks::remote_endpoints(target).await);
    }
    FilterContext {
        agent_pid: std::process::id(),
        sink_endpoints,
    }
}

/// A configured agent, ready to run.
pub struct Agent {
    config: AgentConfig,
    sinks: Option<Vec<Box<dyn Sink>>>,
}

impl Agent {
    /// Creates an agent that builds its sinks from the configuration.
    pub const fn new(config: AgentConfig) -> Self {
        Self { config, sinks: None }
    }

    /// Creates an agent delivering to the given sinks instead of the
    /// configured ones. The configured sinks still define which endpoints
    /// count as self-traffic.
    pub const fn with_sinks(config: AgentConfig, sinks: Vec<Box<dyn Sink>>) -> Self {
        Self {
            config,
            sinks: Some(sinks),
        }
    }

    /// Runs until `shutdown` resolves or the source fails.
    ///
    /// The dispatcher is always drained before returning, also on failure.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Source`] if connection tracking is unavailable or
    /// keeps failing, and [`AgentError::NoSinks`] if no sink could be built.
    pub async fn run<F>(self, shutdown: F) -> Result<AgentReport>
    where
        F: Future<Output = ()> + Send,
    {
        let Self { config, sinks } = self;
        config.validate()?;
        let stop = Arc::new(AtomicBool::new(false));
        let source = ConntrackSource::open(config.source.clone(), Arc::clone(&stop))?;

        let sinks = match sinks {
            Some(sinks) => sinks,
            None => build_sinks(&config).await?,
        };
        let context = filter_context(&config).await;
        let dispatcher = Dispatcher::spawn(sinks, &config.dispatch);
        let handle = dispatcher.handle();
        tracing::info!(
            agent = %config.agent.uuid,
            name = %config.agent.name,
            sinks = handle.sink_count(),
            self_endpoints = context.sink_endpoints.len(),
            "agent starting"
        );

        let pipeline = Pipeline::new(&config, context);
        let mut ingestion = tokio::task::spawn_blocking(move || {
            let mut source = source;
            let result = pipeline.run(&mut source, &handle);
            if source.malformed_lines() > 0 {
                tracing::warn!(malformed = source.malformed_lines(), "skipped malformed conntrack lines");
            }
            result
        });

        let finished = tokio::select! {
            () = shutdown => None,
            joined = &mut ingestion => Some(joined),
        };
        let joined = match finished {
            Some(joined) => joined,
            None => {
                tracing::info!("shutdown requested");
                stop.store(true, Ordering::Relaxed);
                ingestion.await
            }
        };

        let sinks = dispatcher.shutdown().await;
        let pipeline = match joined {
            Ok(Ok(counters)) => counters,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "conntrack source failed");
                return Err(e.into());
            }
            Err(e) => {
                return Err(AgentError::Ingestion {
                    message: e.to_string(),
                });
            }
        };
        tracing::info!(
            emitted = pipeline.emitted,
            unattributed = pipeline.unattributed,
            duplicates = pipeline.duplicates,
            dropped_dns = pipeline.dropped_dns,
            dropped_self = pipeline.dropped_self,
            dropped_non_process = pipeline.dropped_non_process,
            "agent stopped"
        );
        Ok(AgentReport { pipeline, sinks })
    }
}
