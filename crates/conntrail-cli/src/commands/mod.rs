//! CLI command definitions and dispatch.

pub mod check_config;
pub mod run;
pub mod snapshot;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use conntrail_common::config::AgentConfig;

/// conntrail — attributes network connections to the processes that own them.
#[derive(Parser, Debug)]
#[command(name = "conntrail", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the agent configuration file.
    #[arg(
        long,
        short,
        global = true,
        env = "CONNTRAIL_CONFIG",
        default_value = conntrail_common::constants::DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Log at debug level unless `CONNTRAIL_LOG` says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Log output format.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent until interrupted.
    Run(run::RunArgs),
    /// Load and validate the configuration, then print the resolved sinks.
    CheckConfig(check_config::CheckConfigArgs),
    /// Print the current connections with their owners as JSON lines.
    Snapshot(snapshot::SnapshotArgs),
}

/// Loads and validates the configuration at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config(path: &Path) -> anyhow::Result<AgentConfig> {
    AgentConfig::from_file(path).with_context(|| format!("cannot use configuration {}", path.display()))
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => run::execute(&cli.config, &args),
        Command::CheckConfig(args) => check_config::execute(&cli.config, &args),
        Command::Snapshot(args) => snapshot::execute(&cli.config, &args),
    }
}
