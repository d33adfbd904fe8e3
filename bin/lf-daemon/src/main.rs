//! LogFlow Daemon
//!
//! Loads the configuration, wires the built-in collaborators and runs the
//! lifecycle controller until a termination signal arrives.
//!
//! ## Usage
//!
//! `logflowd [CONFIG_FILE]` loads the given TOML file. Without an argument
//! `LOGFLOW_CONFIG` and the standard search paths are tried, and
//! `LOGFLOW_*` environment variables override individual keys.
//! `logflowd --example-config` prints a commented configuration.
//!
//! ## Signals
//!
//! - SIGHUP: re-resolve the host name, reload the configuration snapshot
//!   and reopen action outputs
//! - SIGTERM / SIGINT: orderly shutdown; the fifth signal aborts
//!
//! ## Exit codes
//!
//! 0 on normal shutdown, 1 on fatal initialization errors, 2 when the
//! configuration needed repairs and `abort_on_unclean_config` is set.

use std::sync::Arc;
use anyhow::{Context, Result};
use lf_config::{ConfigLoader, DaemonConfig};
use lf_router::{spawn_signal_listener, ConsoleAction, DaemonExit, LifecycleController, DEFAULT_RULESET};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    lf_common::logging::init_logging("logflowd");

    let exit = match run().await {
        Ok(exit) => exit,
        Err(e) => {
            error!(error = %e, "Fatal error");
            eprintln!("logflowd: {:#}", e);
            DaemonExit::Fatal
        }
    };
    info!(code = exit.code(), "LogFlow daemon exiting");
    std::process::exit(exit.code());
}

async fn run() -> Result<DaemonExit> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--example-config") {
        print!("{}", DaemonConfig::example_toml());
        return Ok(DaemonExit::Normal);
    }

    let loader = match args.first() {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load().context("Failed to load configuration")?;

    let report = config.validate();
    if !report.is_clean() {
        for issue in report.issues() {
            warn!(issue = %issue, "Configuration repaired");
        }
        if config.global.abort_on_unclean_config {
            error!(issues = report.issues().len(), "Unclean configuration and abort_on_unclean_config is set");
            return Ok(DaemonExit::UncleanConfig);
        }
    }

    info!(
        work_directory = %config.global.work_directory,
        main_queue_size = config.main_queue.size,
        rulesets = config.rulesets.len(),
        "Starting LogFlow daemon"
    );

    let mut controller = LifecycleController::new(config)
        .with_config_source(loader)
        .with_action(DEFAULT_RULESET, Arc::new(ConsoleAction::new()));

    controller.initialize()?;
    // installed before start so early signals are queued for the control loop
    let _signals = spawn_signal_listener(controller.control_handle())
        .context("Failed to install signal handlers")?;
    controller.start().await.context("Failed to start queues")?;

    Ok(controller.run().await)
}
