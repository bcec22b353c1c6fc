//! CLI module for edgeplane
//!
//! Provides command-line interface for:
//! - serve: Boot the runtime and the HTTP gateway
//! - install: Pre-fetch the edge runtime binary
//! - check: Validate a configuration file

mod args;
mod commands;
mod config;
mod errors;

pub use args::{Cli, Command};
pub use commands::{check, install, run, run_command, serve};
pub use config::Config;
pub use errors::{CliError, CliErrorCode, CliResult};
