use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use drainspout::agent::Agent;
use drainspout::config::Config;

/// Sidecar telemetry agent for pre-forking request servers.
#[derive(Parser)]
#[command(name = "drainspout", version = build_version(), about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Version string shown by --version: the release plus build metadata.
/// The commit hash is injected at build time via GIT_COMMIT.
fn build_version() -> &'static str {
    Box::leak(
        format!(
            "{} (commit: {}, {}/{})",
            env!("CARGO_PKG_VERSION"),
            option_env!("GIT_COMMIT").unwrap_or("unknown"),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
        .into_boxed_str(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // One line carrying the whole resolved surface: anything that makes
    // two deployments behave differently should be greppable here.
    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = option_env!("GIT_COMMIT").unwrap_or("unknown"),
        socket_stats_mode = cfg.socket_stats_mode.as_str(),
        worker_count_mode = cfg.effective_worker_count_mode().as_str(),
        server_port = cfg.server_port,
        proc_directory = %cfg.proc_directory.display(),
        frequency_ms = cfg.frequency_ms,
        worker_frequency_ms = cfg.worker_frequency_ms,
        memory_stats_enabled = cfg.memory_stats_enabled,
        "starting drainspout",
    );
    warn_missing_identity(&cfg);

    let mut agent = Agent::new(cfg);
    agent.start().await?;

    wait_for_shutdown().await?;

    agent.stop().await?;
    info!("drainspout stopped");

    Ok(())
}

/// Block until SIGINT or SIGTERM arrives.
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    Ok(())
}

/// The identity tags are optional, but an empty one usually means a
/// missing downward-API env var, so call each out at startup.
fn warn_missing_identity(cfg: &Config) {
    for (key, value) in [
        ("pod-name", &cfg.pod_name),
        ("pod-namespace", &cfg.pod_namespace),
        ("project", &cfg.project),
    ] {
        if value.is_empty() {
            warn!(key, "identity tag is not set");
        }
    }
}
