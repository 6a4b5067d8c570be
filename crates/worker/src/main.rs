use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use earngate_core::config::Settings;
use earngate_core::ingest::provider::{HttpEpsRevProvider, HttpPriceProvider};
use earngate_core::pipeline::{EpsRevProcessor, PipelineContext, PricesProcessor};
use earngate_core::storage::blob::{BlobStore, MemoryBlobStore, PgBlobStore};
use earngate_core::storage::facts::{FactStore, MemoryFactStore, PgFactStore};
use earngate_core::storage::lock::{self, DayLockGuard};
use earngate_core::watchdog::{RunMode, Watchdog};
use sqlx::PgPool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "earngate_worker")]
struct Args {
    /// Earnings day (YYYY-MM-DD). Defaults to today's market-local date.
    #[arg(long, global = true)]
    day: Option<String>,

    /// Use in-memory stores; nothing is written to the database.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch, stage and (if the gate passes) publish one or both dimensions.
    Batch {
        #[arg(long, value_enum, default_value_t = DimensionArg::All)]
        dimension: DimensionArg,

        /// Comma separated tickers. Defaults to EARNINGS_TICKERS.
        #[arg(long, value_delimiter = ',')]
        tickers: Vec<String>,
    },
    /// Check freshness and coverage, re-running processors when needed.
    Watchdog {
        /// Keep running on WATCHDOG_INTERVAL_SECS until Ctrl-C / SIGTERM.
        #[arg(long)]
        daemon: bool,
    },
    /// Print the latest pointer and the day's publish state as JSON.
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DimensionArg {
    Prices,
    EpsRev,
    All,
}

struct Stores {
    pool: Option<PgPool>,
    blobs: Arc<dyn BlobStore>,
    facts: Arc<dyn FactStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();
    let day = earngate_core::time::market::resolve_day(
        args.day.as_deref(),
        chrono::Utc::now(),
        settings.market_offset,
    )?;

    let stores = open_stores(&settings, args.dry_run).await?;
    let result = match args.command {
        Command::Batch { dimension, tickers } => {
            run_batch(&settings, &stores, day, dimension, tickers).await
        }
        Command::Watchdog { daemon } => {
            anyhow::ensure!(
                args.day.is_none(),
                "--day is not supported by watchdog; it always checks today's market day"
            );
            run_watchdog(&settings, &stores, daemon).await
        }
        Command::Status => print_status(&stores, day).await,
    };

    if let Err(err) = &result {
        sentry_anyhow::capture_anyhow(err);
    }
    if let Some(pool) = stores.pool {
        pool.close().await;
    }
    result
}

async fn open_stores(settings: &Settings, dry_run: bool) -> anyhow::Result<Stores> {
    if dry_run {
        tracing::info!(dry_run = true, "using in-memory stores");
        return Ok(Stores {
            pool: None,
            blobs: Arc::new(MemoryBlobStore::new()),
            facts: Arc::new(MemoryFactStore::new()),
        });
    }

    let db_url = settings.require_database_url()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .context("connect DATABASE_URL failed")?;

    earngate_core::storage::migrate(&pool).await?;

    Ok(Stores {
        blobs: Arc::new(PgBlobStore::new(pool.clone())),
        facts: Arc::new(PgFactStore::new(pool.clone())),
        pool: Some(pool),
    })
}

enum DayLock {
    Held(DayLockGuard),
    /// Dry runs have no database session to lock.
    NotNeeded,
    /// Another process is already working on the day.
    Busy,
}

async fn acquire_lock(stores: &Stores, day: NaiveDate) -> anyhow::Result<DayLock> {
    let Some(pool) = &stores.pool else {
        return Ok(DayLock::NotNeeded);
    };
    match lock::try_acquire_day_lock(pool, day).await? {
        Some(guard) => Ok(DayLock::Held(guard)),
        None => {
            tracing::warn!(%day, "day lock not acquired; another run in progress");
            Ok(DayLock::Busy)
        }
    }
}

async fn release_lock(lock: DayLock) {
    if let DayLock::Held(guard) = lock {
        let day = guard.day();
        if let Err(err) = guard.release().await {
            tracing::warn!(%day, error = %format!("{err:#}"), "failed to release day lock");
        }
    }
}

fn pipeline_context(settings: &Settings, stores: &Stores) -> PipelineContext {
    PipelineContext::new(
        stores.blobs.clone(),
        stores.facts.clone(),
        &settings.pipeline,
        &settings.worker_tag,
    )
}

async fn run_batch(
    settings: &Settings,
    stores: &Stores,
    day: NaiveDate,
    dimension: DimensionArg,
    tickers: Vec<String>,
) -> anyhow::Result<()> {
    let tickers = if tickers.is_empty() {
        settings.universe.clone()
    } else {
        tickers
    };
    anyhow::ensure!(
        !tickers.is_empty(),
        "no tickers given; pass --tickers or set EARNINGS_TICKERS"
    );

    let guard = acquire_lock(stores, day).await?;
    if matches!(guard, DayLock::Busy) {
        return Ok(());
    }

    let ctx = pipeline_context(settings, stores);
    let mut failures = Vec::new();

    if matches!(dimension, DimensionArg::Prices | DimensionArg::All) {
        let result = match HttpPriceProvider::from_settings(settings) {
            Ok(provider) => PricesProcessor::prices(ctx.clone(), Arc::new(provider))
                .run_batch(&tickers, day)
                .await
                .map_err(anyhow::Error::new),
            Err(err) => Err(err),
        };
        match result {
            Ok(report) => tracing::info!(
                %day,
                coverage = ?report.coverage,
                published = report.published(),
                "prices batch complete"
            ),
            Err(err) => {
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(%day, error = %format!("{err:#}"), "prices batch failed");
                failures.push("prices");
            }
        }
    }

    if matches!(dimension, DimensionArg::EpsRev | DimensionArg::All) {
        let result = match HttpEpsRevProvider::from_settings(settings) {
            Ok(provider) => EpsRevProcessor::eps_rev(ctx.clone(), Arc::new(provider))
                .run_batch(&tickers, day)
                .await
                .map_err(anyhow::Error::new),
            Err(err) => Err(err),
        };
        match result {
            Ok(report) => tracing::info!(
                %day,
                coverage = ?report.coverage,
                published = report.published(),
                "eps_rev batch complete"
            ),
            Err(err) => {
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(%day, error = %format!("{err:#}"), "eps_rev batch failed");
                failures.push("eps_rev");
            }
        }
    }

    release_lock(guard).await;
    anyhow::ensure!(failures.is_empty(), "batch failed for: {}", failures.join(", "));
    Ok(())
}

async fn run_watchdog(settings: &Settings, stores: &Stores, daemon: bool) -> anyhow::Result<()> {
    let watchdog = Watchdog::new(
        pipeline_context(settings, stores),
        Arc::new(HttpPriceProvider::from_settings(settings)?),
        Arc::new(HttpEpsRevProvider::from_settings(settings)?),
        settings.watchdog.policy.clone(),
        settings.universe.clone(),
    );

    if daemon {
        // Days roll over while the daemon runs; it relies on the in-process day locks.
        let mode = RunMode::Daemon {
            interval: settings.watchdog.interval,
            tick_timeout: settings.watchdog.tick_timeout,
        };
        return watchdog.run(mode, shutdown_signal()).await;
    }

    // Lock the same day the tick will work on.
    let now = chrono::Utc::now();
    let guard = acquire_lock(stores, watchdog.market_day(now)).await?;
    if matches!(guard, DayLock::Busy) {
        return Ok(());
    }
    let result = watchdog
        .run(RunMode::Once { at: now }, std::future::pending::<()>())
        .await;
    release_lock(guard).await;
    result
}

async fn print_status(stores: &Stores, day: NaiveDate) -> anyhow::Result<()> {
    let snapshots = earngate_core::storage::snapshots::SnapshotStore::new(stores.blobs.clone());
    let latest = snapshots.load_latest().await?;
    let metadata = stores.facts.load_publish_metadata(day).await?;
    let rows = stores.facts.count_rows(day).await?;
    let published = snapshots.load_published(day).await?;

    let status = serde_json::json!({
        "day": day,
        "latest": latest,
        "metadata": metadata,
        "rows": rows,
        "published": published.map(|s| serde_json::json!({
            "published_at": s.published_at,
            "coverage": s.coverage,
            "tickers": s.records.len(),
        })),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
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

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(settings.app_env.clone().into()),
            ..Default::default()
        },
    )))
}
