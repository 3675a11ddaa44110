//! Gateway Daemon - WebSocket Tool Server
//!
//! Entry point for ai-gateway. Loads configuration, takes the single-instance
//! lock, builds the provider registry, router, tools and dispatcher, and
//! serves WebSocket clients until signalled.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:8765)
//! gateway-daemon
//!
//! # Custom bind address and config file
//! gateway-daemon --host 0.0.0.0 --port 9000 --config /etc/ai-gateway/gateway.toml
//!
//! # Require a token in hello
//! GATEWAY_AUTH_TOKEN=s3cret gateway-daemon
//!
//! # Daemonize (run in background)
//! gateway-daemon --daemonize
//!
//! # Verbose logging
//! RUST_LOG=debug gateway-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Logged; configuration is read at startup only

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use gateway_core::config::secs;
use gateway_core::{
    load_config_from_path, spawn_snapshot_task, ConfigOverrides, Dispatcher, FallbackOrchestrator, GatewayServer,
    LivenessProbe, ProcessLock, ProviderRegistry, RouterService, ToolRegistry,
};

/// Gateway Daemon - WebSocket tool server with provider routing
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Bind port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Shared secret required in hello
    #[arg(long, env = "GATEWAY_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// PID lock file path
    #[arg(long, value_name = "PATH")]
    lock_path: Option<PathBuf>,

    /// Health snapshot file path
    #[arg(long, value_name = "PATH")]
    health_path: Option<PathBuf>,

    /// Run as daemon (fork to background)
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("gateway_daemon={level},gateway_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Daemonize the process (fork to background)
fn daemonize() -> Result<()> {
    use nix::unistd::{fork, setsid, ForkResult};

    // First fork
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("First fork failed: {e}"),
    }

    setsid().context("setsid failed")?;

    // Second fork (prevent acquiring controlling terminal)
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => anyhow::bail!("Second fork failed: {e}"),
    }

    Ok(())
}

fn spawn_signal_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    warn!("Received SIGHUP; configuration is only read at startup, restart to apply changes");
                }
            }
        }
    });
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Fork before the runtime starts its worker threads
    if args.daemonize {
        daemonize()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    init_logging(&args.log_level);

    info!("Gateway daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config_path = args.config.clone().or_else(gateway_core::config::default_config_path);
    let mut config = load_config_from_path(config_path.as_deref())
        .with_context(|| format!("Failed to load configuration from {config_path:?}"))?;
    ConfigOverrides {
        host: args.host,
        port: args.port,
        auth_token: args.auth_token,
        lock_path: args.lock_path,
        health_path: args.health_path,
    }
    .apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if let Some(path) = &config.config_file_path {
        info!(config_path = ?path, "Config file");
    }
    if config.auth_token.is_none() {
        warn!("No auth token configured; every hello is accepted");
    }

    let lock_path = config.process.lock_path();
    let health_path = config.process.health_path();
    info!(lock_path = ?lock_path, health_path = ?health_path, "Process files");

    let probe = LivenessProbe {
        addr: format!("{}:{}", config.server.host, config.server.port),
        health_path: health_path.clone(),
        stale_after: secs(config.process.stale_lock_secs),
    };
    let lock = ProcessLock::acquire(&lock_path, &probe).await?;

    // Routing → tools → dispatch
    let registry = Arc::new(ProviderRegistry::from_config(&config.routing));
    let providers = registry.available_providers();
    if providers.is_empty() {
        warn!("No providers configured; set OPENAI_API_KEY, XAI_API_KEY, MOONSHOT_API_KEY, OPENROUTER_API_KEY or CUSTOM_API_URL");
    } else {
        info!(providers = ?providers, "Providers available");
    }

    let router = Arc::new(RouterService::new(Arc::clone(&registry), &config.routing));
    let tools = Arc::new(ToolRegistry::builtin(&router));
    let orchestrator = Arc::new(FallbackOrchestrator::new(
        Arc::clone(&tools),
        Arc::clone(&router),
        config.fallback.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(&config, tools, Arc::clone(&router)).with_orchestrator(orchestrator));

    if config.routing.preflight {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            for result in router.preflight().await {
                if result.ok {
                    info!(model = %result.model, "Preflight passed");
                } else {
                    warn!(model = %result.model, error = ?result.error, "Preflight failed");
                }
            }
        });
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(Arc::clone(&shutdown))?;

    let server = GatewayServer::new(Arc::clone(&dispatcher), config.server.clone());
    let listener = server
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.host, config.server.port))?;

    let snapshots = spawn_snapshot_task(
        Arc::clone(&dispatcher),
        health_path.clone(),
        secs(config.process.snapshot_interval_secs),
    );

    server.run(listener, shutdown).await;

    // Cleanup
    info!("Shutting down...");
    snapshots.abort();
    if let Err(e) = tokio::fs::remove_file(&health_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!(error = %e, path = ?health_path, "Failed to remove health snapshot");
        }
    }
    drop(lock);

    info!("Gateway daemon stopped cleanly");
    Ok(())
}
