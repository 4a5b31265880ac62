use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use flowmon::agent::Agent;
use flowmon::config::Config;
use flowmon::metrics::Metrics;
use flowmon::status;

/// Linux TCP congestion monitor.
#[derive(Parser)]
#[command(name = "flowmon", about)]
struct Cli {
    /// Path to the YAML configuration file; defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error);
    /// overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

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
    /// Release version string.
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

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("flowmon {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting flowmon",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let metrics = Arc::new(Metrics::new());

    let agent = Agent::new(&cfg, Arc::clone(&metrics))?;
    let cancel = agent.cancel_token();

    // Status endpoint, if configured.
    if !cfg.status.addr.is_empty() {
        let addr = cfg.status.addr.clone();
        let status_metrics = Arc::clone(&metrics);
        let status_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, status_metrics, status_cancel).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // Signal handling: SIGINT/SIGTERM stop the run, SIGUSR1 dumps the
    // metrics snapshot to the log.
    {
        let cancel = cancel.clone();
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            let mut sigusr1 =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
                    .expect("failed to register SIGUSR1 handler");

            loop {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        tracing::info!("received SIGINT, shutting down");
                        cancel.cancel();
                        return;
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                        cancel.cancel();
                        return;
                    }
                    _ = sigusr1.recv() => {
                        tracing::info!("metrics snapshot\n{}", metrics.render());
                    }
                }
            }
        });
    }

    match agent.run().await {
        Ok(()) => {
            tracing::info!("successful termination");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            Err(e.into())
        }
    }
}
