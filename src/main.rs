use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use chainmeter::config::Config;
use chainmeter::engine::Engine;
use chainmeter::export::health::HealthMetrics;
use chainmeter::export::server::Server;
use chainmeter::replay;

/// Metrics aggregation engine for a blockchain node dashboard.
#[derive(Parser)]
#[command(name = "chainmeter", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Replay recorded node events from an NDJSON file, then keep serving.
    Replay {
        /// Event file, one JSON object per line.
        file: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

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
        println!("chainmeter {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(level) = &cli.log_level {
        cfg.log_level = level.clone();
    }
    if let Some(Command::Replay { file }) = cli.command {
        cfg.replay.path = Some(file);
    }

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting chainmeter",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to register SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        signal_token.cancel();
    });

    let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);
    let engine = Arc::new(
        Engine::new(cfg.engine.clone(), health).context("building aggregation engine")?,
    );
    engine.start()?;

    let server = Server::new(&cfg.health.addr);
    server.start(Arc::clone(&engine)).await?;

    if let Some(path) = &cfg.replay.path {
        match replay::replay(&engine, path, cfg.replay.pace, &shutdown).await {
            Ok(stats) => tracing::info!(
                applied = stats.applied,
                skipped = stats.skipped,
                "replay complete, serving snapshot",
            ),
            Err(e) => tracing::error!(error = %e, "replay failed"),
        }
    }

    shutdown.cancelled().await;

    server.stop().await?;
    engine.stop().await?;

    tracing::info!("chainmeter stopped");

    Ok(())
}
