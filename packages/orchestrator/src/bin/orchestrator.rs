//! Crawler fleet orchestrator
//!
//! `serve` (default) recovers leftovers from a previous run, optionally
//! starts a batch, and exposes the control surface over HTTP until Ctrl-C.
//! `run-once` runs a single batch through post-processing and exits.
//! `dedup` lets jobs written in any language consult their dedup cache; it
//! prints JSON for the caller to parse.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use orchestrator_core::dedup::DedupCache;
use orchestrator_core::{http, Config, ControlSurface, StartOutcome};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "orchestrator")]
#[command(about = "Runs crawler jobs under a concurrency cap and post-processes their output")]
struct Cli {
    /// Look-back window passed to every job as `--days N`
    #[arg(long, global = true)]
    days: Option<u32>,

    /// Control surface port
    #[arg(long, global = true)]
    port: Option<u16>,

    #[arg(long, global = true)]
    max_concurrency: Option<usize>,

    /// Do not start a batch at boot
    #[arg(long, global = true)]
    no_auto_start: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control surface (default)
    Serve,

    /// Run one batch, wait for post-processing, exit
    RunOnce,

    /// Query or update a dedup cache namespace
    Dedup {
        #[command(subcommand)]
        action: DedupAction,
    },
}

#[derive(Subcommand)]
enum DedupAction {
    /// Print whether a key should be processed
    Check {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record a key as seen
    Record {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Evict expired keys
    Prune {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(days) = cli.days {
        config.lookback_days = days;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(n) = cli.max_concurrency {
        anyhow::ensure!(n >= 1, "--max-concurrency must be at least 1");
        config.max_concurrency = n;
    }
    if cli.no_auto_start {
        config.auto_start = false;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Dedup { action } => dedup(&config, action),
        command => {
            init_tracing();
            match command {
                Commands::RunOnce => run_once(config).await,
                _ => serve(config).await,
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!(
        work_dir = %config.work_dir.display(),
        run_date = %config.run_date,
        jobs = config.jobs.len(),
        max_concurrency = config.max_concurrency,
        "starting orchestrator"
    );

    let control = ControlSurface::from_config(&config);
    let older = control
        .recover_and_settle()
        .await
        .context("startup recovery failed")?;

    // Older run-dates never overlap a batch, so they upload in the background.
    let recovery_control = control.clone();
    tokio::spawn(async move {
        for (job, outcome) in recovery_control.upload_pending(older).await {
            tracing::info!(job_id = %job, outcome = ?outcome, "leftover folder processed");
        }
    });

    if config.auto_start {
        log_start(control.start(None).await?);
    }

    let app = http::router(control.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("control surface listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down, stopping running jobs");
    let stopped = control.stop(None).await?;
    control.flush_ledger().await;
    tracing::info!(stopped = stopped.len(), "orchestrator stopped");
    Ok(())
}

async fn run_once(config: Config) -> Result<()> {
    let control = ControlSurface::from_config(&config);
    let older = control
        .recover_and_settle()
        .await
        .context("startup recovery failed")?;
    control.upload_pending(older).await;

    let epoch = match control.start(None).await? {
        StartOutcome::Started { epoch, .. } => epoch,
        StartOutcome::Conflict(id) => anyhow::bail!("job {id} is already running"),
    };

    tokio::select! {
        result = control.wait_for_batch(epoch) => result?,
        _ = shutdown_signal() => {
            tracing::warn!("interrupted, stopping running jobs");
            control.stop(None).await?;
        }
    }
    control.flush_ledger().await;
    Ok(())
}

fn log_start(outcome: StartOutcome) {
    match outcome {
        StartOutcome::Started {
            epoch,
            admitted,
            queued,
        } => tracing::info!(epoch, admitted = admitted.len(), queued = queued.len(), "batch started"),
        StartOutcome::Conflict(id) => tracing::info!(job_id = %id, "already running"),
    }
}

fn dedup(config: &Config, action: DedupAction) -> Result<()> {
    let today = |date: Option<NaiveDate>| date.unwrap_or_else(|| Utc::now().date_naive());
    let dir = config.dedup_dir();
    let retention = config.dedup_retention_days;

    let output = match action {
        DedupAction::Check {
            namespace,
            key,
            date,
        } => {
            let cache = DedupCache::open(&dir, &namespace, retention);
            json!({ "namespace": namespace, "key": key, "process": cache.should_process(&key, today(date)) })
        }
        DedupAction::Record {
            namespace,
            key,
            date,
        } => {
            let mut cache = DedupCache::open(&dir, &namespace, retention);
            cache
                .record(&key, today(date))
                .with_context(|| format!("failed to write {}", cache.path().display()))?;
            json!({ "namespace": namespace, "key": key, "recorded": true })
        }
        DedupAction::Prune { namespace, date } => {
            let mut cache = DedupCache::open(&dir, &namespace, retention);
            let removed = cache
                .prune(today(date))
                .with_context(|| format!("failed to write {}", cache.path().display()))?;
            json!({ "namespace": namespace, "removed": removed, "remaining": cache.len() })
        }
    };

    println!("{output}");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
