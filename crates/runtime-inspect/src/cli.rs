//! CLI argument parsing via clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Read the runtime history recorded by the agent runner.
#[derive(Debug, Parser)]
#[command(name = "runtime-inspect", version)]
pub struct Args {
    /// Data directory the runner writes to.
    #[arg(long = "data-dir", env = "AGENT_RT_DATA_DIR", default_value = ".agent-data")]
    pub data_dir: PathBuf,

    /// Print JSON instead of text.
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List agents that have recorded runtimes.
    Agents,

    /// List an agent's runtimes, oldest first.
    List { agent_id: String },

    /// Show one runtime's snapshot.
    Show { agent_id: String, runtime_id: Uuid },

    /// Print a runtime's event log.
    Events { agent_id: String, runtime_id: Uuid },

    /// Print a runtime's tool call records.
    Calls { agent_id: String, runtime_id: Uuid },

    /// Delete a runtime and everything recorded for it.
    Delete { agent_id: String, runtime_id: Uuid },
}
