use crate::domain::snapshot::{Coverage, Dimension, PublishMetadata, PublishStatus, ReportTime};
use crate::ingest::types::{EpsRevReport, PriceQuote};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Audit row written once per processor run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRun {
    pub id: Uuid,
    pub day: NaiveDate,
    pub dimension: Dimension,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `success`, `partial` or `error`.
    pub status: &'static str,
    pub error: Option<String>,
    pub report: serde_json::Value,
}

/// Persistent per-`(day, ticker)` facts plus the per-day publish metadata.
#[async_trait::async_trait]
pub trait FactStore: Send + Sync {
    /// Writes only the price columns; EPS/revenue columns of an existing row are untouched.
    async fn upsert_price(&self, day: NaiveDate, quote: &PriceQuote) -> anyhow::Result<()>;

    /// Writes only the schedule and EPS/revenue columns.
    async fn upsert_eps_rev(&self, day: NaiveDate, report: &EpsRevReport) -> anyhow::Result<()>;

    async fn find_tickers(&self, day: NaiveDate) -> anyhow::Result<Vec<String>>;

    async fn count_rows(&self, day: NaiveDate) -> anyhow::Result<i64>;

    async fn upsert_publish_metadata(&self, meta: &PublishMetadata) -> anyhow::Result<()>;

    async fn load_publish_metadata(&self, day: NaiveDate)
        -> anyhow::Result<Option<PublishMetadata>>;

    async fn record_ingest_run(&self, run: &IngestRun) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgFactStore {
    pool: sqlx::PgPool,
}

impl PgFactStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl FactStore for PgFactStore {
    async fn upsert_price(&self, day: NaiveDate, quote: &PriceQuote) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO earnings_facts (day, ticker, last_price, market_cap, price_as_of, price_source, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, now()) \
             ON CONFLICT (day, ticker) DO UPDATE SET \
               last_price = EXCLUDED.last_price, \
               market_cap = EXCLUDED.market_cap, \
               price_as_of = EXCLUDED.price_as_of, \
               price_source = EXCLUDED.price_source, \
               updated_at = now()",
        )
        .persistent(false)
        .bind(day)
        .bind(&quote.ticker)
        .bind(quote.last_price)
        .bind(quote.market_cap)
        .bind(quote.as_of)
        .bind(&quote.source)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert earnings_facts price failed (ticker={})", quote.ticker))?;
        Ok(())
    }

    async fn upsert_eps_rev(&self, day: NaiveDate, report: &EpsRevReport) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO earnings_facts (day, ticker, report_time, eps_estimate, eps_actual, revenue_estimate, revenue_actual, eps_rev_source, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now()) \
             ON CONFLICT (day, ticker) DO UPDATE SET \
               report_time = EXCLUDED.report_time, \
               eps_estimate = EXCLUDED.eps_estimate, \
               eps_actual = EXCLUDED.eps_actual, \
               revenue_estimate = EXCLUDED.revenue_estimate, \
               revenue_actual = EXCLUDED.revenue_actual, \
               eps_rev_source = EXCLUDED.eps_rev_source, \
               updated_at = now()",
        )
        .persistent(false)
        .bind(day)
        .bind(&report.ticker)
        .bind(report.report_time.map(ReportTime::as_str))
        .bind(report.eps_estimate)
        .bind(report.eps_actual)
        .bind(report.revenue_estimate)
        .bind(report.revenue_actual)
        .bind(&report.source)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "upsert earnings_facts eps/rev failed (ticker={})",
                report.ticker
            )
        })?;
        Ok(())
    }

    async fn find_tickers(&self, day: NaiveDate) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT ticker FROM earnings_facts WHERE day = $1 ORDER BY ticker ASC")
                .persistent(false)
                .bind(day)
                .fetch_all(&self.pool)
                .await
                .context("select earnings_facts tickers failed")?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }

    async fn count_rows(&self, day: NaiveDate) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM earnings_facts WHERE day = $1")
            .persistent(false)
            .bind(day)
            .fetch_one(&self.pool)
            .await
            .context("count earnings_facts failed")?;
        Ok(count.0)
    }

    async fn upsert_publish_metadata(&self, meta: &PublishMetadata) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO publish_metadata (day, schedule_coverage, price_coverage, eps_rev_coverage, status, published_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (day) DO UPDATE SET \
               schedule_coverage = EXCLUDED.schedule_coverage, \
               price_coverage = EXCLUDED.price_coverage, \
               eps_rev_coverage = EXCLUDED.eps_rev_coverage, \
               status = EXCLUDED.status, \
               published_at = EXCLUDED.published_at, \
               updated_at = EXCLUDED.updated_at",
        )
        .persistent(false)
        .bind(meta.day)
        .bind(i16::from(meta.coverage.schedule))
        .bind(i16::from(meta.coverage.price))
        .bind(i16::from(meta.coverage.eps_rev))
        .bind(meta.status.as_str())
        .bind(meta.published_at)
        .bind(meta.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert publish_metadata failed (day={})", meta.day))?;
        Ok(())
    }

    async fn load_publish_metadata(
        &self,
        day: NaiveDate,
    ) -> anyhow::Result<Option<PublishMetadata>> {
        let row = sqlx::query_as::<
            _,
            (
                NaiveDate,
                i16,
                i16,
                i16,
                String,
                Option<DateTime<Utc>>,
                DateTime<Utc>,
            ),
        >(
            "SELECT day, schedule_coverage, price_coverage, eps_rev_coverage, status, published_at, updated_at \
             FROM publish_metadata WHERE day = $1",
        )
        .persistent(false)
        .bind(day)
        .fetch_optional(&self.pool)
        .await
        .context("select publish_metadata failed")?;

        let Some((day, schedule, price, eps_rev, status, published_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(PublishMetadata {
            day,
            coverage: Coverage {
                schedule: pct_from_db(schedule)?,
                price: pct_from_db(price)?,
                eps_rev: pct_from_db(eps_rev)?,
            },
            status: PublishStatus::parse(&status)?,
            published_at,
            updated_at,
        }))
    }

    async fn record_ingest_run(&self, run: &IngestRun) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO ingest_runs (id, day, dimension, started_at, finished_at, status, error, report) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .persistent(false)
        .bind(run.id)
        .bind(run.day)
        .bind(run.dimension.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status)
        .bind(run.error.as_deref())
        .bind(&run.report)
        .execute(&self.pool)
        .await
        .context("insert ingest_runs failed")?;
        Ok(())
    }
}

fn pct_from_db(v: i16) -> anyhow::Result<u8> {
    let pct = u8::try_from(v).with_context(|| format!("coverage out of range in DB: {v}"))?;
    anyhow::ensure!(pct <= 100, "coverage out of range in DB: {pct}");
    Ok(pct)
}

/// Column image of one `earnings_facts` row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactRow {
    pub report_time: Option<ReportTime>,
    pub last_price: Option<f64>,
    pub market_cap: Option<i64>,
    pub price_as_of: Option<NaiveDate>,
    pub price_source: Option<String>,
    pub eps_estimate: Option<f64>,
    pub eps_actual: Option<f64>,
    pub revenue_estimate: Option<i64>,
    pub revenue_actual: Option<i64>,
    pub eps_rev_source: Option<String>,
}

/// Process-local fact store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryFactStore {
    rows: tokio::sync::Mutex<BTreeMap<(NaiveDate, String), FactRow>>,
    metadata: tokio::sync::Mutex<BTreeMap<NaiveDate, PublishMetadata>>,
    runs: tokio::sync::Mutex<Vec<IngestRun>>,
    failing_tickers: std::sync::Mutex<BTreeSet<String>>,
    fail_metadata: AtomicBool,
}

impl MemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes upserts for `ticker` fail until cleared.
    pub fn fail_upserts_for(&self, ticker: &str) {
        if let Ok(mut set) = self.failing_tickers.lock() {
            set.insert(ticker.to_string());
        }
    }

    pub fn fail_metadata_writes(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    pub async fn row(&self, day: NaiveDate, ticker: &str) -> Option<FactRow> {
        self.rows.lock().await.get(&(day, ticker.to_string())).cloned()
    }

    pub async fn rows_for(&self, day: NaiveDate) -> BTreeMap<String, FactRow> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|((d, _), _)| *d == day)
            .map(|((_, t), row)| (t.clone(), row.clone()))
            .collect()
    }

    pub async fn runs(&self) -> Vec<IngestRun> {
        self.runs.lock().await.clone()
    }

    fn check_ticker(&self, ticker: &str) -> anyhow::Result<()> {
        let failing = self
            .failing_tickers
            .lock()
            .map(|set| set.contains(ticker))
            .unwrap_or(false);
        anyhow::ensure!(!failing, "injected upsert failure (ticker={ticker})");
        Ok(())
    }
}

#[async_trait::async_trait]
impl FactStore for MemoryFactStore {
    async fn upsert_price(&self, day: NaiveDate, quote: &PriceQuote) -> anyhow::Result<()> {
        self.check_ticker(&quote.ticker)?;
        let mut rows = self.rows.lock().await;
        let row = rows.entry((day, quote.ticker.clone())).or_default();
        row.last_price = quote.last_price;
        row.market_cap = quote.market_cap;
        row.price_as_of = Some(quote.as_of);
        row.price_source = Some(quote.source.clone());
        Ok(())
    }

    async fn upsert_eps_rev(&self, day: NaiveDate, report: &EpsRevReport) -> anyhow::Result<()> {
        self.check_ticker(&report.ticker)?;
        let mut rows = self.rows.lock().await;
        let row = rows.entry((day, report.ticker.clone())).or_default();
        row.report_time = report.report_time;
        row.eps_estimate = report.eps_estimate;
        row.eps_actual = report.eps_actual;
        row.revenue_estimate = report.revenue_estimate;
        row.revenue_actual = report.revenue_actual;
        row.eps_rev_source = Some(report.source.clone());
        Ok(())
    }

    async fn find_tickers(&self, day: NaiveDate) -> anyhow::Result<Vec<String>> {
        Ok(self.rows_for(day).await.into_keys().collect())
    }

    async fn count_rows(&self, day: NaiveDate) -> anyhow::Result<i64> {
        Ok(self.rows_for(day).await.len() as i64)
    }

    async fn upsert_publish_metadata(&self, meta: &PublishMetadata) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.fail_metadata.load(Ordering::SeqCst),
            "injected publish_metadata failure"
        );
        self.metadata.lock().await.insert(meta.day, meta.clone());
        Ok(())
    }

    async fn load_publish_metadata(
        &self,
        day: NaiveDate,
    ) -> anyhow::Result<Option<PublishMetadata>> {
        Ok(self.metadata.lock().await.get(&day).cloned())
    }

    async fn record_ingest_run(&self, run: &IngestRun) -> anyhow::Result<()> {
        self.runs.lock().await.push(run.clone());
        Ok(())
    }
}
