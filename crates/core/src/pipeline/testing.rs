//! Scripted providers and in-memory wiring shared by pipeline and watchdog tests.

use crate::domain::fallback::FallbackPolicy;
use crate::domain::snapshot::ReportTime;
use crate::gate::DqThresholds;
use crate::ingest::provider::{EpsRevProvider, PriceProvider};
use crate::ingest::types::{EpsRevReport, PriceQuote};
use crate::pipeline::{BatchingOptions, DayLocks, PipelineContext};
use crate::retry::{FetchError, RetryPolicy};
use crate::storage::blob::MemoryBlobStore;
use crate::storage::facts::MemoryFactStore;
use crate::storage::snapshots::SnapshotStore;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 7, 28).unwrap()
}

pub fn tickers(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("T{i:03}")).collect()
}

pub fn quote(ticker: &str, price: f64, as_of: NaiveDate) -> PriceQuote {
    PriceQuote {
        ticker: ticker.to_string(),
        last_price: Some(price),
        market_cap: Some(1_000_000_000),
        as_of,
        source: "scripted".to_string(),
    }
}

pub fn eps_report(
    ticker: &str,
    report_time: Option<ReportTime>,
    fallback_policy: FallbackPolicy,
) -> EpsRevReport {
    EpsRevReport {
        ticker: ticker.to_string(),
        report_time,
        eps_estimate: Some(1.25),
        eps_actual: Some(1.31),
        revenue_estimate: Some(94_000_000_000),
        revenue_actual: Some(95_500_000_000),
        source: "scripted".to_string(),
        fallback_policy,
    }
}

pub fn context(
    thresholds: DqThresholds,
) -> (PipelineContext, Arc<MemoryBlobStore>, Arc<MemoryFactStore>) {
    let blobs = Arc::new(MemoryBlobStore::new());
    let facts = Arc::new(MemoryFactStore::new());
    let ctx = PipelineContext {
        snapshots: SnapshotStore::new(blobs.clone()),
        facts: facts.clone(),
        locks: DayLocks::new(),
        thresholds,
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 2.0,
            jitter: Duration::ZERO,
        },
        batching: BatchingOptions {
            batch_size: 25,
            inter_batch_delay: Duration::ZERO,
        },
        worker_tag: "test-worker".to_string(),
    };
    (ctx, blobs, facts)
}

fn not_found(ticker: &str) -> FetchError {
    FetchError::Http {
        status: 404,
        body: format!("unknown ticker {ticker}"),
    }
}

/// Answers from a fixed table; unscripted tickers get a 404.
#[derive(Default)]
pub struct ScriptedPrices {
    answers: Mutex<HashMap<String, Result<PriceQuote, FetchError>>>,
    calls: AtomicUsize,
}

impl ScriptedPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&self, quote: PriceQuote) {
        self.answers
            .lock()
            .unwrap()
            .insert(quote.ticker.clone(), Ok(quote));
    }

    pub fn fail(&self, ticker: &str, err: FetchError) {
        self.answers
            .lock()
            .unwrap()
            .insert(ticker.to_string(), Err(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl PriceProvider for ScriptedPrices {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_price(&self, ticker: &str, _day: NaiveDate) -> Result<PriceQuote, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answers = self.answers.lock().unwrap();
        answers
            .get(ticker)
            .cloned()
            .unwrap_or_else(|| Err(not_found(ticker)))
    }
}

#[derive(Default)]
pub struct ScriptedEpsRev {
    answers: Mutex<HashMap<String, Result<EpsRevReport, FetchError>>>,
    calls: AtomicUsize,
}

impl ScriptedEpsRev {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&self, report: EpsRevReport) {
        self.answers
            .lock()
            .unwrap()
            .insert(report.ticker.clone(), Ok(report));
    }

    pub fn fail(&self, ticker: &str, err: FetchError) {
        self.answers
            .lock()
            .unwrap()
            .insert(ticker.to_string(), Err(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EpsRevProvider for ScriptedEpsRev {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_eps_rev(
        &self,
        ticker: &str,
        _day: NaiveDate,
    ) -> Result<EpsRevReport, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answers = self.answers.lock().unwrap();
        answers
            .get(ticker)
            .cloned()
            .unwrap_or_else(|| Err(not_found(ticker)))
    }
}
