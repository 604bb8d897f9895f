//! `conntrail snapshot` — dump the current connections once.

use std::io::Write;
use std::path::Path;

use clap::Args;

use super::load_config;

/// Arguments for the `snapshot` command.
#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Only print connections attributed to a process.
    #[arg(long)]
    pub attributed: bool,
}

/// Executes the `snapshot` command.
///
/// Prints one JSON record per live connection, without filtering, so the
/// output shows exactly what the agent can see with its current privileges.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the conntrack table
/// cannot be read.
pub fn execute(config_path: &Path, args: &SnapshotArgs) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let records = conntrail_agent::snapshot::snapshot(&config)?;

    let mut out = std::io::stdout().lock();
    let mut shown = 0_usize;
    for record in records
        .iter()
        .filter(|r| !args.attributed || r.program_details.is_some())
    {
        writeln!(out, "{}", serde_json::to_string(record)?)?;
        shown += 1;
    }
    tracing::info!(total = records.len(), shown, "snapshot complete");
    Ok(())
}
