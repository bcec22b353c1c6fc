//! CLI argument definitions using clap
//!
//! Commands:
//! - edgeplane serve --config <path>
//! - edgeplane install --config <path>
//! - edgeplane check --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// edgeplane - control plane for self-hosted edge functions
#[derive(Parser, Debug)]
#[command(name = "edgeplane")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the runtime and serve the gateway until Ctrl-C
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./edgeplane.json")]
        config: PathBuf,
    },

    /// Download and verify the edge runtime binary, then exit
    Install {
        /// Path to configuration file
        #[arg(long, default_value = "./edgeplane.json")]
        config: PathBuf,
    },

    /// Validate the configuration file and exit
    Check {
        /// Path to configuration file
        #[arg(long, default_value = "./edgeplane.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
