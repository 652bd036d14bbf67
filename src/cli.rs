use std::{path::PathBuf, sync::OnceLock};

use clap::{Parser, Subcommand};

/// Safe, recoverable container updates.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "decant.toml", global = true)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Move a container to a new tag or digest of its image.
    Update {
        /// Container name or id.
        container: String,
        /// New tag of the container's image.
        #[arg(long, conflicts_with = "digest", required_unless_present = "digest")]
        tag: Option<String>,
        /// New digest of the container's image, e.g. `sha256:...`.
        #[arg(long)]
        digest: Option<String>,
    },
    /// Settle operations left in progress by an interrupted run.
    Reconcile,
    /// Print the recorded update operations of a container as JSON.
    History { container: String },
    /// Finish a self-update. Started by decant inside a helper container.
    #[command(hide = true)]
    Helper,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
