use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use metricsd::config::Config;
use metricsd::engine::{wall_clock_ns, ConfigKey, EngineUpgradeBridge, MetricsEngine};
use metricsd::export::HealthServer;
use metricsd::stats::GuardrailStats;
use metricsd::uidmap::{PackageListener, UidMap};

/// Device-side telemetry daemon: configuration-driven metrics engine.
#[derive(Parser)]
#[command(name = "metricsd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("metricsd {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting metricsd",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let stats = Arc::new(GuardrailStats::new());
    let uid_map = Arc::new(UidMap::with_byte_limit(
        Arc::clone(&stats),
        cfg.uid_map.max_bytes,
    ));
    let engine = Arc::new(MetricsEngine::new(Arc::clone(&uid_map), Arc::clone(&stats)));

    // Bucket splits on app upgrade flow from the uid map into the engine.
    let bridge: Arc<dyn PackageListener> =
        Arc::new(EngineUpgradeBridge(Arc::downgrade(&engine)));
    uid_map.register_listener(Arc::downgrade(&bridge));

    // Metric configs shipped with the daemon config.
    let now_elapsed = 0;
    let now_wall = wall_clock_ns();
    for bootstrap in &cfg.bootstrap_configs {
        let raw = std::fs::read_to_string(&bootstrap.path)
            .with_context(|| format!("reading metrics config {}", bootstrap.path))?;
        let metrics_config = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing metrics config {}", bootstrap.path))?;
        let key = ConfigKey::new(bootstrap.uid, bootstrap.id);
        engine
            .install_config(key, metrics_config, now_elapsed, now_wall)
            .with_context(|| format!("installing metrics config {key}"))?;
    }

    let cancel = CancellationToken::new();
    engine.spawn_alarm_monitor(cancel.clone());

    let health = if cfg.health.enabled {
        let server = Arc::new(HealthServer::new(&cfg.health.addr, Arc::clone(&stats))?);
        server.start().await?;
        Some(server)
    } else {
        None
    };

    // Wait for shutdown signal.
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    cancel.cancel();
    if let Some(server) = health {
        server.stop();
    }

    tracing::info!("metricsd stopped");
    Ok(())
}
