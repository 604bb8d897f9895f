//! `conntrail check-config` — validate a configuration file.

use std::io::Write;
use std::path::Path;

use clap::Args;
use conntrail_common::config::AgentConfig;

use super::load_config;
use crate::output::{format_millis, on_off};

/// Arguments for the `check-config` command.
#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Only report success or failure.
    #[arg(short, long)]
    pub quiet: bool,
}

fn render(config: &AgentConfig, out: &mut impl Write) -> std::io::Result<()> {
    writeln!(out, "agent      {} ({})", config.agent.name, config.agent.uuid)?;
    writeln!(out, "proc root  {}", config.source.proc_root.display())?;
    writeln!(out, "interval   {}", format_millis(config.source.poll_interval_ms))?;
    writeln!(
        out,
        "filters    non-process {}, dns {}, self-traffic {}",
        on_off(config.filters.suppress_non_process_connections),
        on_off(config.filters.suppress_dns),
        on_off(config.filters.suppress_self_traffic),
    )?;
    writeln!(out)?;
    writeln!(out, "{:<16} {:<8} TARGET", "KIND", "NETWORK")?;
    for sink in &config.sinks {
        writeln!(
            out,
            "{:<16} {:<8} {}",
            sink.kind().to_string(),
            if sink.is_network_bound() { "yes" } else { "no" },
            sink.display_name(),
        )?;
    }
    Ok(())
}

/// Executes the `check-config` command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or is invalid.
pub fn execute(config_path: &Path, args: &CheckConfigArgs) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let mut out = std::io::stdout().lock();
    if args.quiet {
        writeln!(out, "{}: ok", config_path.display())?;
    } else {
        render(&config, &mut out)?;
    }
    Ok(())
}
