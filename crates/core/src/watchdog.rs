//! Self-healing loop: re-runs the batch processors when the published pointer goes stale or a
//! day's coverage lags behind its time-of-day floor.

use crate::domain::snapshot::{LatestPointer, PublishMetadata, PublishStatus};
use crate::ingest::provider::{EpsRevProvider, PriceProvider};
use crate::pipeline::{
    normalize_tickers, BatchReport, EpsRevProcessor, PipelineContext, PipelineError,
    PricesProcessor,
};
use crate::time::market;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct WatchdogPolicy {
    /// Maximum age of `meta:latest` before both processors are re-run.
    pub freshness: chrono::Duration,
    pub price_cutoff: NaiveTime,
    pub price_floor: u8,
    pub eps_rev_late_cutoff: NaiveTime,
    pub eps_rev_late_floor: u8,
    pub market_offset: FixedOffset,
}

impl WatchdogPolicy {
    pub fn with_offset(market_offset: FixedOffset) -> Self {
        Self {
            freshness: chrono::Duration::hours(26),
            price_cutoff: NaiveTime::from_hms_opt(16, 30, 0).unwrap_or(NaiveTime::MIN),
            price_floor: 90,
            eps_rev_late_cutoff: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(NaiveTime::MIN),
            eps_rev_late_floor: 90,
            market_offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum Trigger {
    MissingPointer,
    StalePointer { age_minutes: i64 },
    /// Today's metadata says published but `meta:latest` still names an older day.
    PointerBehind { latest_day: NaiveDate },
    PriceBelowFloor { coverage: u8, floor: u8 },
    EpsRevMissing,
    EpsRevBelowLateFloor { coverage: u8, floor: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogPlan {
    pub day: NaiveDate,
    pub triggers: Vec<Trigger>,
    pub rerun_prices: bool,
    pub rerun_eps_rev: bool,
}

impl WatchdogPlan {
    pub fn is_idle(&self) -> bool {
        !self.rerun_prices && !self.rerun_eps_rev
    }
}

/// Decides what to re-run. Missing metadata counts as zero coverage; cutoffs are inclusive.
pub fn plan(
    now: DateTime<Utc>,
    latest: Option<&LatestPointer>,
    metadata: Option<&PublishMetadata>,
    policy: &WatchdogPolicy,
) -> WatchdogPlan {
    let day = now.with_timezone(&policy.market_offset).date_naive();
    let local = market::local_time(now, policy.market_offset);
    let coverage = metadata.map(|m| m.coverage).unwrap_or_default();

    let mut triggers = Vec::new();
    let mut rerun_prices = false;
    let mut rerun_eps_rev = false;

    match latest {
        None => triggers.push(Trigger::MissingPointer),
        Some(pointer) => {
            let age = now.signed_duration_since(pointer.published_at);
            if age > policy.freshness {
                triggers.push(Trigger::StalePointer {
                    age_minutes: age.num_minutes(),
                });
            } else if pointer.day < day
                && metadata.is_some_and(|m| m.status == PublishStatus::Published)
            {
                triggers.push(Trigger::PointerBehind {
                    latest_day: pointer.day,
                });
            }
        }
    }
    if !triggers.is_empty() {
        rerun_prices = true;
        rerun_eps_rev = true;
    }

    if local >= policy.price_cutoff && coverage.price < policy.price_floor {
        triggers.push(Trigger::PriceBelowFloor {
            coverage: coverage.price,
            floor: policy.price_floor,
        });
        rerun_prices = true;
    }

    if coverage.eps_rev == 0 {
        triggers.push(Trigger::EpsRevMissing);
        rerun_eps_rev = true;
    } else if local >= policy.eps_rev_late_cutoff && coverage.eps_rev < policy.eps_rev_late_floor {
        triggers.push(Trigger::EpsRevBelowLateFloor {
            coverage: coverage.eps_rev,
            floor: policy.eps_rev_late_floor,
        });
        rerun_eps_rev = true;
    }

    WatchdogPlan {
        day,
        triggers,
        rerun_prices,
        rerun_eps_rev,
    }
}

#[derive(Debug)]
pub struct TickReport {
    pub plan: WatchdogPlan,
    pub tickers: usize,
    pub prices: Option<Result<BatchReport, PipelineError>>,
    pub eps_rev: Option<Result<BatchReport, PipelineError>>,
}

#[derive(Debug, Clone, Copy)]
pub enum RunMode {
    /// A single tick evaluated at `at`.
    Once { at: DateTime<Utc> },
    /// Tick immediately, then every `interval`; each tick is cut off after `tick_timeout`.
    Daemon {
        interval: Duration,
        tick_timeout: Duration,
    },
}

pub struct Watchdog {
    ctx: PipelineContext,
    prices: PricesProcessor,
    eps_rev: EpsRevProcessor,
    policy: WatchdogPolicy,
    universe: Vec<String>,
}

impl Watchdog {
    pub fn new(
        ctx: PipelineContext,
        price_provider: Arc<dyn PriceProvider>,
        eps_rev_provider: Arc<dyn EpsRevProvider>,
        policy: WatchdogPolicy,
        universe: Vec<String>,
    ) -> Self {
        Self {
            prices: PricesProcessor::prices(ctx.clone(), price_provider),
            eps_rev: EpsRevProcessor::eps_rev(ctx.clone(), eps_rev_provider),
            ctx,
            policy,
            universe,
        }
    }

    pub async fn run_watchdog_tick(&self) -> anyhow::Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// The market-local day a tick at `now` works on.
    pub fn market_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.policy.market_offset).date_naive()
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> anyhow::Result<TickReport> {
        let day = self.market_day(now);

        // An unreadable pointer is as good as a missing one; re-publishing rewrites it.
        let latest = match self.ctx.snapshots.load_latest().await {
            Ok(latest) => latest,
            Err(err) => {
                tracing::warn!(
                    error = %format!("{err:#}"),
                    "meta:latest unreadable; treating as missing"
                );
                None
            }
        };
        let metadata = self.ctx.facts.load_publish_metadata(day).await?;

        let plan = plan(now, latest.as_ref(), metadata.as_ref(), &self.policy);
        if plan.is_idle() {
            tracing::debug!(%day, "watchdog tick: nothing to do");
            return Ok(TickReport {
                plan,
                tickers: 0,
                prices: None,
                eps_rev: None,
            });
        }
        tracing::info!(
            %day,
            triggers = ?plan.triggers,
            rerun_prices = plan.rerun_prices,
            rerun_eps_rev = plan.rerun_eps_rev,
            "watchdog triggered"
        );

        let tickers = self.tickers_for(day).await?;
        if tickers.is_empty() {
            tracing::warn!(%day, "watchdog has no tickers for the day; set EARNINGS_TICKERS");
            return Ok(TickReport {
                plan,
                tickers: 0,
                prices: None,
                eps_rev: None,
            });
        }

        let prices = if plan.rerun_prices {
            let res = self.prices.run_batch(&tickers, day).await;
            log_failure("prices", &res);
            Some(res)
        } else {
            None
        };
        let eps_rev = if plan.rerun_eps_rev {
            let res = self.eps_rev.run_batch(&tickers, day).await;
            log_failure("eps_rev", &res);
            Some(res)
        } else {
            None
        };

        Ok(TickReport {
            plan,
            tickers: tickers.len(),
            prices,
            eps_rev,
        })
    }

    pub async fn run<F>(&self, mode: RunMode, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (interval, tick_timeout) = match mode {
            RunMode::Once { at } => {
                self.tick_at(at).await?;
                return Ok(());
            }
            RunMode::Daemon {
                interval,
                tick_timeout,
            } => (interval, tick_timeout),
        };

        tracing::info!(?interval, ?tick_timeout, "watchdog daemon started");
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested; watchdog stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match tokio::time::timeout(tick_timeout, self.run_watchdog_tick()).await {
                Ok(Ok(report)) => tracing::debug!(
                    day = %report.plan.day,
                    triggers = report.plan.triggers.len(),
                    tickers = report.tickers,
                    "watchdog tick done"
                ),
                Ok(Err(err)) => {
                    tracing::error!(error = %format!("{err:#}"), "watchdog tick failed")
                }
                Err(_) => tracing::warn!(?tick_timeout, "watchdog tick timed out"),
            }
        }
        Ok(())
    }

    /// The configured universe plus every ticker the day has seen: stored facts and the records
    /// of the staging and published snapshots. Tickers that failed everywhere only show up in
    /// the snapshots.
    async fn tickers_for(&self, day: NaiveDate) -> anyhow::Result<Vec<String>> {
        let mut tickers = self.universe.clone();
        tickers.extend(self.ctx.facts.find_tickers(day).await?);

        let staging = self.ctx.snapshots.load_staging(day).await?;
        let published = self.ctx.snapshots.load_published(day).await?;
        for snapshot in staging.iter().chain(published.iter()) {
            tickers.extend(snapshot.records.keys().cloned());
        }
        Ok(normalize_tickers(&tickers))
    }
}

fn log_failure(label: &str, res: &Result<BatchReport, PipelineError>) {
    if let Err(err) = res {
        tracing::error!(processor = label, error = %err, "watchdog re-run failed");
    }
}
