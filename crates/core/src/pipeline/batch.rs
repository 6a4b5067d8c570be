use crate::coverage::{self, ExclusionSet};
use crate::domain::fallback;
use crate::domain::snapshot::{
    DailySnapshot, Dimension, LatestPointer, PublishMetadata, PublishStatus, TickerRecord,
};
use crate::gate;
use crate::ingest::provider::{EpsRevProvider, PriceProvider};
use crate::ingest::types::{EpsRevReport, PriceQuote};
use crate::pipeline::{normalize_tickers, BatchReport, PipelineContext, PipelineError};
use crate::retry::{self, BatchOutcome, FetchError};
use crate::storage::facts::{FactStore, IngestRun};
use crate::storage::snapshots::Promotion;
use anyhow::Context;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// One dimension's source of truth: how to fetch it, persist it and fold it into a record.
#[async_trait::async_trait]
pub trait DimensionIngest: Send + Sync {
    type Item: Clone + Send + Sync + 'static;

    fn dimension(&self) -> Dimension;

    async fn fetch(&self, ticker: &str, day: NaiveDate) -> Result<Self::Item, FetchError>;

    async fn upsert(
        &self,
        facts: &dyn FactStore,
        day: NaiveDate,
        item: &Self::Item,
    ) -> anyhow::Result<()>;

    /// Overwrites this dimension's field group on `record`.
    fn merge(&self, record: &mut TickerRecord, day: NaiveDate, item: &Self::Item);

    /// Upstream answered 404 for the ticker.
    fn mark_not_found(&self, record: &mut TickerRecord);

    /// Fetch or upsert failed for a non-404 reason; fields from earlier runs are retained.
    fn mark_failed(&self, _record: &mut TickerRecord) {}
}

pub struct PriceIngest {
    provider: Arc<dyn PriceProvider>,
}

impl PriceIngest {
    pub fn new(provider: Arc<dyn PriceProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl DimensionIngest for PriceIngest {
    type Item = PriceQuote;

    fn dimension(&self) -> Dimension {
        Dimension::Price
    }

    async fn fetch(&self, ticker: &str, day: NaiveDate) -> Result<PriceQuote, FetchError> {
        self.provider.fetch_price(ticker, day).await
    }

    async fn upsert(
        &self,
        facts: &dyn FactStore,
        day: NaiveDate,
        quote: &PriceQuote,
    ) -> anyhow::Result<()> {
        facts.upsert_price(day, quote).await
    }

    fn merge(&self, record: &mut TickerRecord, day: NaiveDate, quote: &PriceQuote) {
        record.last_price = quote.last_price;
        record.market_cap = quote.market_cap;
        record.price_as_of = Some(quote.as_of);
        record.price_source = Some(quote.source.clone());
        record.stale = quote.as_of < day;
        record.not_found.remove(&Dimension::Price);
    }

    fn mark_not_found(&self, record: &mut TickerRecord) {
        record.last_price = None;
        record.market_cap = None;
        record.price_as_of = None;
        record.price_source = None;
        record.stale = false;
        record.not_found.insert(Dimension::Price);
    }

    fn mark_failed(&self, record: &mut TickerRecord) {
        if record.last_price.is_some() {
            record.stale = true;
        }
    }
}

/// Earnings calendar rows: the report time (schedule) plus EPS and revenue.
pub struct EpsRevIngest {
    provider: Arc<dyn EpsRevProvider>,
}

impl EpsRevIngest {
    pub fn new(provider: Arc<dyn EpsRevProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl DimensionIngest for EpsRevIngest {
    type Item = EpsRevReport;

    fn dimension(&self) -> Dimension {
        Dimension::EpsRev
    }

    async fn fetch(&self, ticker: &str, day: NaiveDate) -> Result<EpsRevReport, FetchError> {
        self.provider.fetch_eps_rev(ticker, day).await
    }

    async fn upsert(
        &self,
        facts: &dyn FactStore,
        day: NaiveDate,
        report: &EpsRevReport,
    ) -> anyhow::Result<()> {
        facts.upsert_eps_rev(day, report).await
    }

    fn merge(&self, record: &mut TickerRecord, _day: NaiveDate, report: &EpsRevReport) {
        record.report_time = report.report_time;
        record.eps_estimate = report.eps_estimate;
        record.eps_actual = report.eps_actual;
        record.revenue_estimate = report.revenue_estimate;
        record.revenue_actual = report.revenue_actual;
        record.eps_rev_source = Some(report.source.clone());
        record.fallback_policy = report.fallback_policy;
        record.applied_fallbacks.clear();
        record.not_found.remove(&Dimension::Schedule);
        record.not_found.remove(&Dimension::EpsRev);

        let applied = fallback::apply_rules(record);
        if !applied.is_empty() {
            tracing::debug!(ticker = %record.ticker, ?applied, "fallback rules applied");
        }
    }

    // No calendar entry means neither a schedule nor EPS/revenue can exist for the day.
    fn mark_not_found(&self, record: &mut TickerRecord) {
        record.report_time = None;
        record.eps_estimate = None;
        record.eps_actual = None;
        record.revenue_estimate = None;
        record.revenue_actual = None;
        record.eps_rev_source = None;
        record.applied_fallbacks.clear();
        record.not_found.insert(Dimension::Schedule);
        record.not_found.insert(Dimension::EpsRev);
    }
}

pub struct BatchProcessor<S: DimensionIngest> {
    ctx: PipelineContext,
    source: S,
}

pub type PricesProcessor = BatchProcessor<PriceIngest>;
pub type EpsRevProcessor = BatchProcessor<EpsRevIngest>;

impl PricesProcessor {
    pub fn prices(ctx: PipelineContext, provider: Arc<dyn PriceProvider>) -> Self {
        Self::new(ctx, PriceIngest::new(provider))
    }
}

impl EpsRevProcessor {
    pub fn eps_rev(ctx: PipelineContext, provider: Arc<dyn EpsRevProvider>) -> Self {
        Self::new(ctx, EpsRevIngest::new(provider))
    }
}

impl<S: DimensionIngest> BatchProcessor<S> {
    pub fn new(ctx: PipelineContext, source: S) -> Self {
        Self { ctx, source }
    }

    pub fn dimension(&self) -> Dimension {
        self.source.dimension()
    }

    pub async fn run_batch(
        &self,
        tickers: &[String],
        day: NaiveDate,
    ) -> Result<BatchReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let dimension = self.dimension();
        tracing::info!(%run_id, %day, %dimension, requested = tickers.len(), "batch run started");

        let result = self.run_inner(run_id, tickers, day).await;
        match &result {
            Ok(report) => tracing::info!(
                %run_id,
                %day,
                %dimension,
                fetched = report.fetched,
                not_found = report.not_found.len(),
                fetch_failed = report.fetch_failed.len(),
                upsert_failed = report.upsert_failed.len(),
                success_rate = report.success_rate,
                published = report.published(),
                "batch run finished"
            ),
            Err(err) => tracing::error!(
                %run_id,
                %day,
                %dimension,
                error = %err,
                "batch run aborted"
            ),
        }

        self.record_run(run_id, day, started_at, &result).await;
        result
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        tickers: &[String],
        day: NaiveDate,
    ) -> Result<BatchReport, PipelineError> {
        let dimension = self.dimension();
        let tickers = normalize_tickers(tickers);
        if tickers.is_empty() {
            tracing::warn!(%day, %dimension, "no tickers to ingest");
        }

        let outcome = self.fetch_all(&tickers, day).await;
        let success_rate = outcome.success_rate();

        let (not_found, failed): (Vec<_>, Vec<_>) = outcome
            .failed
            .into_iter()
            .partition(|(_, err)| err.is_not_found());

        if outcome.succeeded.is_empty() {
            if let Some((_, first)) = failed.first() {
                return Err(PipelineError::UpstreamUnavailable {
                    dimension,
                    day,
                    failed: failed.len(),
                    first_error: first.to_string(),
                });
            }
        }

        let mut written = Vec::with_capacity(outcome.succeeded.len());
        let mut upsert_failed = Vec::new();
        let mut first_upsert_error = None;
        for (ticker, item) in outcome.succeeded {
            match self.source.upsert(self.ctx.facts.as_ref(), day, &item).await {
                Ok(()) => written.push((ticker, item)),
                Err(err) => {
                    tracing::warn!(
                        %day,
                        %dimension,
                        %ticker,
                        error = %format!("{err:#}"),
                        "upsert failed"
                    );
                    first_upsert_error.get_or_insert_with(|| format!("{err:#}"));
                    upsert_failed.push(ticker);
                }
            }
        }
        if written.is_empty() {
            if let Some(detail) = first_upsert_error {
                return Err(PipelineError::StoreUnavailable {
                    dimension,
                    day,
                    detail,
                });
            }
        }

        let not_found: Vec<String> = not_found.into_iter().map(|(t, _)| t).collect();
        let fetch_failed: Vec<String> = failed.into_iter().map(|(t, _)| t).collect();

        let _guard = self.ctx.locks.lock(day).await;

        let mut snapshot = self
            .load_working_snapshot(day)
            .await
            .map_err(|e| self.store_err(day, e))?;
        for (ticker, item) in &written {
            self.source.merge(snapshot.record_mut(ticker), day, item);
        }
        for ticker in &not_found {
            self.source.mark_not_found(snapshot.record_mut(ticker));
        }
        for ticker in fetch_failed.iter().chain(upsert_failed.iter()) {
            self.source.mark_failed(snapshot.record_mut(ticker));
        }
        snapshot
            .flags
            .insert(format!("{}:{}", self.ctx.worker_tag, dimension));

        let exclusions = ExclusionSet::from_snapshot(&snapshot);
        snapshot.coverage = coverage::compute(day, &snapshot, &exclusions);
        snapshot.published_at = None;

        self.ctx
            .snapshots
            .save_staging(&snapshot)
            .await
            .map_err(|e| self.store_err(day, e))?;

        let previous = self
            .ctx
            .facts
            .load_publish_metadata(day)
            .await
            .map_err(|e| self.store_err(day, e))?;
        let (status, published_at) = previous
            .map(|m| (m.status, m.published_at))
            .unwrap_or((PublishStatus::Staging, None));
        let meta = PublishMetadata {
            day,
            coverage: snapshot.coverage,
            status,
            published_at,
            updated_at: Utc::now(),
        };
        self.ctx
            .facts
            .upsert_publish_metadata(&meta)
            .await
            .map_err(|e| self.store_err(day, e))?;

        let decision = gate::evaluate(&snapshot.coverage, &self.ctx.thresholds);
        let promotion = if decision.passed() {
            Some(
                self.publish(&mut snapshot, meta)
                    .await
                    .map_err(|e| self.store_err(day, e))?,
            )
        } else {
            tracing::info!(
                %day,
                %dimension,
                coverage = ?snapshot.coverage,
                "gate closed; staging kept"
            );
            None
        };

        Ok(BatchReport {
            run_id,
            day,
            dimension,
            requested: tickers.len(),
            fetched: written.len() + upsert_failed.len(),
            not_found,
            fetch_failed,
            upsert_failed,
            success_rate,
            coverage: snapshot.coverage,
            decision,
            promotion,
        })
    }

    async fn fetch_all(&self, tickers: &[String], day: NaiveDate) -> BatchOutcome<S::Item> {
        let dimension = self.dimension();
        let batching = &self.ctx.batching;
        let chunk_size = batching.batch_size.max(1);
        let batches = tickers.len().div_ceil(chunk_size);

        let mut outcome = BatchOutcome::default();
        for (idx, chunk) in tickers.chunks(chunk_size).enumerate() {
            if idx > 0 && !batching.inter_batch_delay.is_zero() {
                tokio::time::sleep(batching.inter_batch_delay).await;
            }

            let part = retry::execute_batch(&self.ctx.retry, chunk, |ticker| async move {
                self.source.fetch(&ticker, day).await
            })
            .await;

            tracing::info!(
                %day,
                %dimension,
                batch = idx + 1,
                batches,
                succeeded = part.succeeded.len(),
                failed = part.failed.len(),
                "fetch batch done"
            );
            outcome.extend(part);
        }
        outcome
    }

    /// Staging if present, else a copy of the published snapshot, else empty.
    async fn load_working_snapshot(&self, day: NaiveDate) -> anyhow::Result<DailySnapshot> {
        if let Some(snapshot) = self.ctx.snapshots.load_staging(day).await? {
            return Ok(snapshot);
        }
        if let Some(published) = self.ctx.snapshots.load_published(day).await? {
            tracing::info!(%day, "seeding staging from published snapshot");
            return Ok(published);
        }
        Ok(DailySnapshot::empty(day))
    }

    async fn publish(
        &self,
        snapshot: &mut DailySnapshot,
        meta: PublishMetadata,
    ) -> anyhow::Result<Promotion> {
        let day = snapshot.day;
        let published_at = Utc::now();
        snapshot.published_at = Some(published_at);
        self.ctx
            .snapshots
            .save_staging(snapshot)
            .await
            .context("rewrite staging before promotion failed")?;

        let pointer = LatestPointer {
            day,
            published_at,
            coverage: snapshot.coverage,
        };
        let promotion = self.ctx.snapshots.promote(&pointer).await?;
        if promotion == Promotion::NothingToPublish {
            return Ok(promotion);
        }

        tracing::info!(%day, coverage = ?snapshot.coverage, ?promotion, "snapshot published");

        let published = PublishMetadata {
            status: PublishStatus::Published,
            published_at: Some(published_at),
            updated_at: Utc::now(),
            ..meta
        };
        // The snapshot is already public; a stale metadata row is reconciled by the watchdog.
        if let Err(err) = self.ctx.facts.upsert_publish_metadata(&published).await {
            tracing::error!(
                %day,
                error = %format!("{err:#}"),
                "publish_metadata not updated after promotion"
            );
        }
        Ok(promotion)
    }

    async fn record_run(
        &self,
        run_id: Uuid,
        day: NaiveDate,
        started_at: chrono::DateTime<Utc>,
        result: &Result<BatchReport, PipelineError>,
    ) {
        let (status, error, report) = match result {
            Ok(report) => (
                if report.is_partial() { "partial" } else { "success" },
                None,
                serde_json::to_value(report).unwrap_or_default(),
            ),
            Err(err) => ("error", Some(err.to_string()), serde_json::Value::Null),
        };

        let run = IngestRun {
            id: run_id,
            day,
            dimension: self.dimension(),
            started_at,
            finished_at: Utc::now(),
            status,
            error,
            report,
        };
        if let Err(err) = self.ctx.facts.record_ingest_run(&run).await {
            tracing::warn!(%run_id, error = %format!("{err:#}"), "failed to record ingest run");
        }
    }

    fn store_err(&self, day: NaiveDate, err: anyhow::Error) -> PipelineError {
        PipelineError::StoreUnavailable {
            dimension: self.dimension(),
            day,
            detail: format!("{err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fallback::{FallbackPolicy, FallbackRule};
    use crate::domain::snapshot::ReportTime;
    use crate::gate::DqThresholds;
    use crate::pipeline::testing::{
        context, day, eps_report, quote, tickers, ScriptedEpsRev, ScriptedPrices,
    };
    use crate::storage::snapshots::META_LATEST_KEY;

    const STRICT: DqThresholds = DqThresholds {
        schedule: 0,
        price: 98,
        eps_rev: 90,
    };

    const OPEN: DqThresholds = DqThresholds {
        schedule: 0,
        price: 0,
        eps_rev: 0,
    };

    /// Seeds staging with EPS/revenue for every ticker so only price decides the gate.
    async fn seed_eps_rev(ctx: &PipelineContext, names: &[String]) {
        let mut snap = DailySnapshot::empty(day());
        for t in names {
            let r = snap.record_mut(t);
            r.eps_estimate = Some(1.0);
            r.revenue_estimate = Some(1_000);
        }
        ctx.snapshots.save_staging(&snap).await.unwrap();
    }

    #[tokio::test]
    async fn ninety_nine_of_hundred_priced_publishes() {
        let (ctx, _blobs, _facts) = context(STRICT);
        let names = tickers(100);
        seed_eps_rev(&ctx, &names).await;

        let prices = ScriptedPrices::new();
        for t in &names[..99] {
            prices.ok(quote(t, 10.0, day()));
        }
        prices.fail(&names[99], FetchError::Malformed("no price".into()));

        let report = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&names, day())
            .await
            .unwrap();

        assert_eq!(report.coverage.price, 99);
        assert_eq!(report.coverage.eps_rev, 100);
        assert_eq!(report.coverage.schedule, 0);
        assert!(report.decision.passed());
        assert_eq!(report.promotion, Some(Promotion::Promoted));

        let latest = ctx.snapshots.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.day, day());
        assert_eq!(latest.coverage.price, 99);
        let published = ctx.snapshots.load_published(day()).await.unwrap().unwrap();
        assert!(published.published_at.is_some());
        assert!(ctx.snapshots.load_staging(day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ninety_seven_percent_price_stays_in_staging() {
        let (ctx, _blobs, facts) = context(STRICT);
        let names = tickers(100);
        seed_eps_rev(&ctx, &names).await;

        let prices = ScriptedPrices::new();
        for t in &names[..97] {
            prices.ok(quote(t, 10.0, day()));
        }
        for t in &names[97..] {
            prices.fail(t, FetchError::Http { status: 500, body: "boom".into() });
        }

        let report = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&names, day())
            .await
            .unwrap();

        assert_eq!(report.coverage.price, 97);
        assert!(!report.decision.price);
        assert_eq!(report.promotion, None);
        assert_eq!(report.fetch_failed.len(), 3);
        assert!(ctx.snapshots.load_published(day()).await.unwrap().is_none());
        assert!(ctx.snapshots.load_latest().await.unwrap().is_none());

        let meta = facts.load_publish_metadata(day()).await.unwrap().unwrap();
        assert_eq!(meta.status, PublishStatus::Staging);
        assert_eq!(meta.coverage.price, 97);
    }

    #[tokio::test]
    async fn not_found_is_excluded_not_failed() {
        let (ctx, _blobs, _facts) = context(STRICT);
        let names = tickers(50);
        seed_eps_rev(&ctx, &names).await;

        let prices = ScriptedPrices::new();
        for t in &names[..49] {
            prices.ok(quote(t, 10.0, day()));
        }
        // Unscripted tickers answer 404.

        let report = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&names, day())
            .await
            .unwrap();

        assert_eq!(report.not_found, vec![names[49].clone()]);
        assert!(report.fetch_failed.is_empty());
        assert!(!report.is_partial());
        assert_eq!(report.coverage.price, 100);
        assert!(report.published());

        let published = ctx.snapshots.load_published(day()).await.unwrap().unwrap();
        assert!(published.records[&names[49]]
            .not_found
            .contains(&Dimension::Price));
    }

    #[tokio::test]
    async fn rerun_is_idempotent_in_the_fact_store() {
        let (ctx, _blobs, facts) = context(OPEN);
        let names = tickers(5);
        let prices = Arc::new(ScriptedPrices::new());
        for t in &names {
            prices.ok(quote(t, 42.5, day()));
        }

        let processor = PricesProcessor::prices(ctx, prices);
        processor.run_batch(&names, day()).await.unwrap();
        let once = facts.rows_for(day()).await;
        processor.run_batch(&names, day()).await.unwrap();
        let twice = facts.rows_for(day()).await;

        assert_eq!(once, twice);
        assert_eq!(facts.count_rows(day()).await.unwrap(), 5);
        assert_eq!(facts.runs().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_price_and_marks_it_stale() {
        let (ctx, _blobs, _facts) = context(DqThresholds {
            price: 100,
            ..OPEN
        });
        let names = tickers(2);

        let first = ScriptedPrices::new();
        for t in &names {
            first.ok(quote(t, 7.0, day()));
        }
        PricesProcessor::prices(ctx.clone(), Arc::new(first))
            .run_batch(&names, day())
            .await
            .unwrap();

        // Published at 100%; the next run starts from a seeded staging copy.
        let second = ScriptedPrices::new();
        second.ok(quote(&names[0], 8.0, day()));
        second.fail(&names[1], FetchError::Timeout);
        let report = PricesProcessor::prices(ctx.clone(), Arc::new(second))
            .run_batch(&names, day())
            .await
            .unwrap();

        assert_eq!(report.fetch_failed, vec![names[1].clone()]);
        assert_eq!(report.coverage.price, 100);
        let published = ctx.snapshots.load_published(day()).await.unwrap().unwrap();
        let kept = &published.records[&names[1]];
        assert_eq!(kept.last_price, Some(7.0));
        assert!(kept.stale);
        assert_eq!(published.records[&names[0]].last_price, Some(8.0));
        assert!(!published.records[&names[0]].stale);
    }

    #[tokio::test]
    async fn quote_from_an_earlier_day_is_stale() {
        let (ctx, _blobs, _facts) = context(DqThresholds {
            price: 100,
            ..OPEN
        });
        let prev = day().pred_opt().unwrap();
        let prices = ScriptedPrices::new();
        prices.ok(quote("AAPL", 1.0, prev));

        PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&["AAPL".to_string()], day())
            .await
            .unwrap();
        let published = ctx.snapshots.load_published(day()).await.unwrap().unwrap();
        assert!(published.records["AAPL"].stale);
    }

    #[tokio::test]
    async fn total_fetch_failure_aborts_without_touching_staging() {
        let (ctx, _blobs, facts) = context(OPEN);
        let names = tickers(3);
        let prices = ScriptedPrices::new();
        for t in &names {
            prices.fail(t, FetchError::Connection("refused".into()));
        }

        let err = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&names, day())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::UpstreamUnavailable { failed: 3, .. }));
        assert!(ctx.snapshots.load_staging(day()).await.unwrap().is_none());
        assert!(facts.load_publish_metadata(day()).await.unwrap().is_none());
        let runs = facts.runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "error");
    }

    #[tokio::test]
    async fn all_not_found_is_not_an_outage() {
        let (ctx, _blobs, _facts) = context(OPEN);
        let report = PricesProcessor::prices(ctx, Arc::new(ScriptedPrices::new()))
            .run_batch(&tickers(3), day())
            .await
            .unwrap();
        assert_eq!(report.not_found.len(), 3);
        assert_eq!(report.coverage.price, 0);
    }

    #[tokio::test]
    async fn total_upsert_failure_aborts() {
        let (ctx, _blobs, facts) = context(OPEN);
        let prices = ScriptedPrices::new();
        prices.ok(quote("AAPL", 1.0, day()));
        facts.fail_upserts_for("AAPL");

        let err = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&["AAPL".to_string()], day())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::StoreUnavailable { .. }));
        assert!(ctx.snapshots.load_staging(day()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_upsert_failure_is_partial() {
        let (ctx, _blobs, facts) = context(OPEN);
        let prices = ScriptedPrices::new();
        prices.ok(quote("AAPL", 1.0, day()));
        prices.ok(quote("MSFT", 2.0, day()));
        facts.fail_upserts_for("MSFT");

        let report = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&["AAPL".to_string(), "MSFT".to_string()], day())
            .await
            .unwrap();

        assert_eq!(report.upsert_failed, vec!["MSFT".to_string()]);
        assert_eq!(report.coverage.price, 50);
        assert_eq!(facts.runs().await[0].status, "partial");
    }

    #[tokio::test]
    async fn metadata_failure_prevents_promotion() {
        let (ctx, _blobs, facts) = context(OPEN);
        facts.fail_metadata_writes(true);
        let prices = ScriptedPrices::new();
        prices.ok(quote("AAPL", 1.0, day()));

        let err = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&["AAPL".to_string()], day())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::StoreUnavailable { .. }));
        assert!(ctx.snapshots.load_published(day()).await.unwrap().is_none());
        assert!(ctx.snapshots.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pointer_failure_is_reported_as_stale() {
        let (ctx, blobs, facts) = context(OPEN);
        blobs.fail_sets_on(META_LATEST_KEY);
        let prices = ScriptedPrices::new();
        prices.ok(quote("AAPL", 1.0, day()));

        let report = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&["AAPL".to_string()], day())
            .await
            .unwrap();

        assert!(matches!(report.promotion, Some(Promotion::PointerStale { .. })));
        assert!(ctx.snapshots.load_published(day()).await.unwrap().is_some());
        assert!(ctx.snapshots.load_latest().await.unwrap().is_none());
        let meta = facts.load_publish_metadata(day()).await.unwrap().unwrap();
        assert_eq!(meta.status, PublishStatus::Published);
    }

    #[tokio::test]
    async fn processors_merge_their_own_field_groups() {
        let (ctx, _blobs, facts) = context(STRICT);

        let prices = ScriptedPrices::new();
        prices.ok(quote("AAPL", 190.0, day()));
        let price_report = PricesProcessor::prices(ctx.clone(), Arc::new(prices))
            .run_batch(&["AAPL".to_string()], day())
            .await
            .unwrap();
        // No EPS yet: eps_rev coverage 0 keeps the gate closed.
        assert!(!price_report.published());

        let eps = ScriptedEpsRev::new();
        eps.ok(eps_report("AAPL", Some(ReportTime::AfterClose), FallbackPolicy::Disabled));
        let report = EpsRevProcessor::eps_rev(ctx.clone(), Arc::new(eps))
            .run_batch(&["AAPL".to_string()], day())
            .await
            .unwrap();

        assert_eq!(report.coverage.price, 100);
        assert_eq!(report.coverage.eps_rev, 100);
        assert_eq!(report.coverage.schedule, 100);
        assert!(report.published());

        let published = ctx.snapshots.load_published(day()).await.unwrap().unwrap();
        let rec = &published.records["AAPL"];
        assert_eq!(rec.last_price, Some(190.0));
        assert_eq!(rec.report_time, Some(ReportTime::AfterClose));
        assert!(published.flags.contains("test-worker:price"));
        assert!(published.flags.contains("test-worker:eps_rev"));

        let row = facts.row(day(), "AAPL").await.unwrap();
        assert_eq!(row.last_price, Some(190.0));
        assert_eq!(row.report_time, Some(ReportTime::AfterClose));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_processors_keep_both_field_groups() {
        let names = tickers(30);
        for _ in 0..10 {
            let (ctx, _blobs, _facts) = context(STRICT);
            let prices = ScriptedPrices::new();
            let eps = ScriptedEpsRev::new();
            for t in &names {
                prices.ok(quote(t, 10.0, day()));
                eps.ok(eps_report(t, Some(ReportTime::BeforeOpen), FallbackPolicy::Disabled));
            }
            let prices = PricesProcessor::prices(ctx.clone(), Arc::new(prices));
            let eps = EpsRevProcessor::eps_rev(ctx.clone(), Arc::new(eps));

            let (price_run, eps_run) = tokio::join!(
                prices.run_batch(&names, day()),
                eps.run_batch(&names, day())
            );
            let (price_run, eps_run) = (price_run.unwrap(), eps_run.unwrap());

            // Whichever run merged last saw both groups and published.
            assert!(price_run.published() ^ eps_run.published());
            let published = ctx.snapshots.load_published(day()).await.unwrap().unwrap();
            assert_eq!(published.coverage.price, 100);
            assert_eq!(published.coverage.eps_rev, 100);
            assert_eq!(published.records.len(), 30);
            assert!(published
                .records
                .values()
                .all(|r| r.last_price.is_some() && r.eps_estimate.is_some()));
        }
    }

    #[tokio::test]
    async fn fallback_rules_are_rederived_each_merge() {
        let (ctx, _blobs, _facts) = context(OPEN);

        let eps = ScriptedEpsRev::new();
        let mut report = eps_report(
            "AAPL",
            Some(ReportTime::BeforeOpen),
            FallbackPolicy::EstimateForActual,
        );
        report.eps_actual = None;
        report.revenue_actual = None;
        eps.ok(report.clone());
        EpsRevProcessor::eps_rev(ctx.clone(), Arc::new(eps))
            .run_batch(&["AAPL".to_string()], day())
            .await
            .unwrap();

        let published = ctx.snapshots.load_published(day()).await.unwrap().unwrap();
        let rec = &published.records["AAPL"];
        assert_eq!(rec.eps_actual, rec.eps_estimate);
        assert!(rec.applied_fallbacks.contains(&FallbackRule::EpsEstimateForActual));
        assert!(rec.applied_fallbacks.contains(&FallbackRule::RevenueEstimateForActual));

        // Real actuals arrive: substitutions disappear.
        let eps = ScriptedEpsRev::new();
        report.eps_actual = Some(2.5);
        report.revenue_actual = Some(123);
        eps.ok(report);
        EpsRevProcessor::eps_rev(ctx.clone(), Arc::new(eps))
            .run_batch(&["AAPL".to_string()], day())
            .await
            .unwrap();

        let published = ctx.snapshots.load_published(day()).await.unwrap().unwrap();
        let rec = &published.records["AAPL"];
        assert_eq!(rec.eps_actual, Some(2.5));
        assert!(rec.applied_fallbacks.is_empty());
    }

    #[tokio::test]
    async fn eps_not_found_excludes_schedule_and_eps_rev() {
        let (ctx, _blobs, _facts) = context(OPEN);
        let eps = ScriptedEpsRev::new();
        eps.ok(eps_report("AAPL", Some(ReportTime::AfterClose), FallbackPolicy::Disabled));

        let report = EpsRevProcessor::eps_rev(ctx, Arc::new(eps))
            .run_batch(&["AAPL".to_string(), "ZZZZ".to_string()], day())
            .await
            .unwrap();

        assert_eq!(report.not_found, vec!["ZZZZ".to_string()]);
        assert_eq!(report.coverage.schedule, 100);
        assert_eq!(report.coverage.eps_rev, 100);
    }

    #[tokio::test]
    async fn batches_run_in_chunks() {
        let (mut ctx, _blobs, _facts) = context(OPEN);
        ctx.batching.batch_size = 2;
        let names = tickers(5);
        let prices = Arc::new(ScriptedPrices::new());
        for t in &names {
            prices.ok(quote(t, 1.0, day()));
        }

        let report = PricesProcessor::prices(ctx, prices.clone())
            .run_batch(&names, day())
            .await
            .unwrap();
        assert_eq!(report.fetched, 5);
        assert_eq!(prices.calls(), 5);
    }
}
