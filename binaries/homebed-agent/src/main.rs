//! Homebed Agent - provisions a simulated home on the local host.
//!
//! The agent reads a home description (network name plus devices and the
//! capabilities they need), sets up the network, daemons, adapters and radio
//! emulators, and prints a JSON manifest with the container hints of every
//! device. It keeps everything up until Ctrl-C or SIGTERM, then tears it
//! down again.
//!
//! # Usage
//!
//! ```bash
//! # Provision the home described in a configuration file
//! homebed-agent --config /etc/homebed/home.toml
//!
//! # Show the commands that would run, without touching the host
//! homebed-agent --config home.toml --dry-run
//!
//! # Print the default configuration
//! homebed-agent --print-config
//! ```

mod home;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use homebed_orchestrator::config::LoggingConfig;
use homebed_orchestrator::{DryRunRunner, HomebedConfig, HostContext, HostRunner, PipeBackend, SystemRunner};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::home::Home;

/// CLI arguments for the Homebed Agent.
#[derive(Parser, Debug)]
#[command(
    name = "homebed-agent",
    about = "Provisions a simulated IoT home on the local host",
    version
)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Home network name, overriding the configuration.
    #[arg(long, value_name = "NAME")]
    home: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long)]
    json_logs: bool,

    /// Log host commands instead of running them.
    #[arg(long)]
    dry_run: bool,

    /// Print the default configuration and exit.
    #[arg(long)]
    print_config: bool,
}

/// Applies CLI overrides on top of the loaded configuration.
fn merge_cli_args(config: &mut HomebedConfig, args: &CliArgs) {
    if let Some(ref level) = args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(ref home) = args.home {
        config.home.name = home.clone();
    }
}

fn init_tracing(config: &LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs || config.format == "json" {
        "json"
    } else {
        &config.format
    };

    match format {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

/// Resolves once Ctrl-C or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run(config: HomebedConfig, dry_run: bool) -> Result<()> {
    let (runner, pipes): (Arc<dyn HostRunner>, PipeBackend) = if dry_run {
        warn!("Dry run: host commands are logged, not executed");
        (
            Arc::new(DryRunRunner::with_adapters(config.bluetooth.virtual_adapters)),
            PipeBackend::Placeholder,
        )
    } else {
        (Arc::new(SystemRunner::new()), PipeBackend::Socat)
    };
    let home_config = config.home.clone();
    let ctx = HostContext::builder()
        .runner(runner)
        .pipe_backend(pipes)
        .config(config)
        .build();

    let up_ctx = ctx.clone();
    let mut home = tokio::task::spawn_blocking(move || Home::up(&up_ctx, &home_config))
        .await
        .context("Provisioning task panicked")??;

    if !home.network_state().is_usable() {
        warn!(state = %home.network_state(), "Home network is not usable");
    }
    println!("{}", serde_json::to_string_pretty(&home.manifest())?);

    info!("Home is up, waiting for shutdown signal");
    shutdown_signal().await;
    info!("Shutdown signal received");

    let report = tokio::task::spawn_blocking(move || home.down())
        .await
        .context("Teardown task panicked")?;
    if report.is_clean() {
        info!("Home torn down");
    } else {
        error!(report = %report, "Teardown finished with issues");
    }

    ctx.executor.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Handle --print-config
    if args.print_config {
        let config = HomebedConfig::default();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Load configuration
    let mut config = if let Some(ref config_path) = args.config {
        HomebedConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        HomebedConfig::default()
    };

    merge_cli_args(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging, args.json_logs)?;

    info!(version = env!("CARGO_PKG_VERSION"), home = %config.home.name, "Homebed Agent starting");

    if let Err(e) = run(config, args.dry_run).await {
        error!(error = %e, "Agent failed");
        return Err(e);
    }

    info!("Homebed Agent stopped");
    Ok(())
}
