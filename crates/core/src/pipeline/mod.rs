//! Staged ingestion: fetch → upsert → merge into staging → coverage → gate → promote.

pub mod batch;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::PipelineSettings;
use crate::domain::snapshot::{Coverage, Dimension};
use crate::gate::{DqThresholds, GateDecision};
use crate::retry::RetryPolicy;
use crate::storage::blob::BlobStore;
use crate::storage::facts::FactStore;
use crate::storage::snapshots::{Promotion, SnapshotStore};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use uuid::Uuid;

pub use batch::{
    BatchProcessor, DimensionIngest, EpsRevIngest, EpsRevProcessor, PriceIngest, PricesProcessor,
};

#[derive(Debug, Clone)]
pub struct BatchingOptions {
    /// Tickers fetched concurrently per batch.
    pub batch_size: usize,
    /// Pause between consecutive batches.
    pub inter_batch_delay: Duration,
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self {
            batch_size: 25,
            inter_batch_delay: Duration::from_millis(1_000),
        }
    }
}

/// In-process per-day mutex guarding the staging read-modify-write and promotion.
#[derive(Debug, Clone, Default)]
pub struct DayLocks {
    inner: Arc<std::sync::Mutex<HashMap<NaiveDate, Arc<tokio::sync::Mutex<()>>>>>,
}

impl DayLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, day: NaiveDate) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on.
            map.retain(|d, m| *d == day || Arc::strong_count(m) > 1);
            map.entry(day).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

/// Everything a processor or the watchdog needs; no process-wide singletons.
#[derive(Clone)]
pub struct PipelineContext {
    pub snapshots: SnapshotStore,
    pub facts: Arc<dyn FactStore>,
    pub locks: DayLocks,
    pub thresholds: DqThresholds,
    pub retry: RetryPolicy,
    pub batching: BatchingOptions,
    /// Provenance tag stamped into snapshot flags.
    pub worker_tag: String,
}

impl PipelineContext {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        facts: Arc<dyn FactStore>,
        settings: &PipelineSettings,
        worker_tag: &str,
    ) -> Self {
        Self {
            snapshots: SnapshotStore::new(blobs),
            facts,
            locks: DayLocks::new(),
            thresholds: settings.thresholds,
            retry: settings.retry.clone(),
            batching: settings.batching.clone(),
            worker_tag: worker_tag.to_string(),
        }
    }
}

/// Reasons a processor run aborts for its dimension.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(
        "{dimension} upstream unavailable for {day}: {failed} tickers failed \
         (first error: {first_error})"
    )]
    UpstreamUnavailable {
        dimension: Dimension,
        day: NaiveDate,
        failed: usize,
        first_error: String,
    },
    #[error("{dimension} store unavailable for {day}: {detail}")]
    StoreUnavailable {
        dimension: Dimension,
        day: NaiveDate,
        detail: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub day: NaiveDate,
    pub dimension: Dimension,
    pub requested: usize,
    pub fetched: usize,
    pub not_found: Vec<String>,
    pub fetch_failed: Vec<String>,
    pub upsert_failed: Vec<String>,
    pub success_rate: f64,
    pub coverage: Coverage,
    pub decision: GateDecision,
    pub promotion: Option<Promotion>,
}

impl BatchReport {
    pub fn is_partial(&self) -> bool {
        !self.fetch_failed.is_empty() || !self.upsert_failed.is_empty()
    }

    pub fn published(&self) -> bool {
        matches!(
            self.promotion,
            Some(Promotion::Promoted) | Some(Promotion::PointerStale { .. })
        )
    }
}

/// Trims, upper-cases and de-duplicates tickers, keeping first-seen order.
pub fn normalize_tickers(tickers: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tickers
        .iter()
        .map(|t| t.trim().to_ascii_uppercase())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_and_dedupes() {
        let raw: Vec<String> = [" aapl", "MSFT", "AAPL", "", "msft "]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(normalize_tickers(&raw), vec!["AAPL", "MSFT"]);
    }

    #[tokio::test]
    async fn day_lock_serializes_same_day() {
        let locks = DayLocks::new();
        let day = NaiveDate::from_ymd_opt(2026, 2, 2).unwrap();
        let other = NaiveDate::from_ymd_opt(2026, 2, 3).unwrap();

        let held = locks.lock(day).await;
        // A different day is independent.
        let _other = locks.lock(other).await;

        let again = tokio::time::timeout(Duration::from_millis(50), locks.lock(day)).await;
        assert!(again.is_err(), "same-day lock must wait");

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(500), locks.lock(day)).await;
        assert!(again.is_ok());
    }
}
