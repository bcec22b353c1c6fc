//! CLI command implementations
//!
//! `serve` boot order: config, store, runtime supervisor, service, runtime
//! start, HTTP gateway. Shutdown runs in reverse once Ctrl-C arrives.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::JwtValidator;
use crate::functions::{
    FunctionError, RuntimeManager, Service, Store, TokioProcessController,
};
use crate::http_server::HttpServer;
use crate::observability::{init_tracing, TracingSink};

use super::args::{Cli, Command};
use super::config::Config;
use super::errors::{CliError, CliResult};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    init_tracing("info", cli.json_logs);
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config } => serve(&config),
        Command::Install { config } => install(&config),
        Command::Check { config } => check(&config),
    }
}

fn tokio_runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))
}

fn ensure_dir(path: &Path) -> CliResult<()> {
    fs::create_dir_all(path).map_err(|e| {
        CliError::io_error(format!("cannot create {}: {}", path.display(), e))
    })
}

fn build_runtime(config: &Config) -> Arc<RuntimeManager> {
    Arc::new(RuntimeManager::new(
        config.to_runtime_config(),
        Arc::new(TokioProcessController),
        Arc::new(TracingSink),
    ))
}

/// Start the runtime and serve the gateway until Ctrl-C
pub fn serve(config_path: &Path) -> CliResult<()> {
    let mut config = Config::load(config_path)?;
    config.mint_missing_keys()?;

    ensure_dir(&config.functions.dir)?;
    if let Some(parent) = config.store.path.parent() {
        ensure_dir(parent)?;
    }

    let store = Arc::new(Store::open(&config.store.path, &config.auth.jwt_secret)?);
    let runtime = build_runtime(&config);
    let service = Arc::new(Service::new(
        config.functions.dir.clone(),
        store,
        runtime,
    ));
    let jwt = JwtValidator::new(&config.auth.jwt_secret);

    let rt = tokio_runtime()?;
    rt.block_on(async {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!(op = "shutdown.signal"),
                Err(e) => error!(op = "shutdown.signal.failed", error = %e),
            }
            signal.cancel();
        });

        // A runtime that fails to boot leaves the gateway up in degraded
        // mode; the admin API can restart it.
        match service.start(&shutdown.child_token()).await {
            Ok(()) => {}
            Err(FunctionError::Cancelled) => return Ok(()),
            Err(e) => warn!(op = "runtime.start.failed", error = %e, "serving degraded"),
        }

        let server = HttpServer::new(config.server.clone(), service.clone(), jwt, shutdown);
        let served = server
            .start()
            .await
            .map_err(|e| CliError::boot_failed(format!("HTTP server failed: {}", e)));

        if let Err(e) = service.stop().await {
            error!(op = "runtime.stop.failed", error = %e);
        }
        served
    })
}

/// Download and verify the runtime binary, then exit
pub fn install(config_path: &Path) -> CliResult<()> {
    let mut config = Config::load(config_path)?;
    config.runtime.auto_download = true;
    ensure_dir(&config.runtime.download_dir)?;

    let runtime = build_runtime(&config);
    let rt = tokio_runtime()?;
    let path = rt.block_on(runtime.install())?;

    info!(op = "install.done", path = %path.display(), version = %config.runtime.version);
    println!("{}", path.display());
    Ok(())
}

/// Validate the configuration and exit
pub fn check(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    if !config.functions.dir.is_dir() {
        warn!(
            op = "check.functions_dir.missing",
            dir = %config.functions.dir.display(),
            "will be created on serve"
        );
    }
    println!("{}: ok", config_path.display());
    Ok(())
}
