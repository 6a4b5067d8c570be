use crate::domain::snapshot::{DailySnapshot, LatestPointer};
use crate::storage::blob::BlobStore;
use anyhow::Context;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;

pub const META_LATEST_KEY: &str = "meta:latest";

pub fn staging_key(day: NaiveDate) -> String {
    format!("staging:{day}")
}

pub fn published_key(day: NaiveDate) -> String {
    format!("published:{day}")
}

/// Result of promoting a day's staging snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Promotion {
    Promoted,
    /// `published:{day}` is in place but `meta:latest` could not be written.
    PointerStale { error: String },
    /// No staging snapshot existed for the day.
    NothingToPublish,
}

/// Day-keyed view over a [`BlobStore`].
#[derive(Clone)]
pub struct SnapshotStore {
    blobs: Arc<dyn BlobStore>,
}

impl SnapshotStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub async fn load_staging(&self, day: NaiveDate) -> anyhow::Result<Option<DailySnapshot>> {
        self.load(&staging_key(day)).await
    }

    pub async fn load_published(&self, day: NaiveDate) -> anyhow::Result<Option<DailySnapshot>> {
        self.load(&published_key(day)).await
    }

    pub async fn load_published_raw(&self, day: NaiveDate) -> anyhow::Result<Option<String>> {
        self.blobs.get(&published_key(day)).await
    }

    /// Writes the staging copy and returns the exact blob stored.
    pub async fn save_staging(&self, snapshot: &DailySnapshot) -> anyhow::Result<String> {
        let blob = snapshot.to_blob().context("serialize staging snapshot failed")?;
        self.blobs.set(&staging_key(snapshot.day), &blob).await?;
        Ok(blob)
    }

    pub async fn load_latest(&self) -> anyhow::Result<Option<LatestPointer>> {
        let Some(blob) = self.blobs.get(META_LATEST_KEY).await? else {
            return Ok(None);
        };
        let pointer = serde_json::from_str(&blob).context("invalid meta:latest blob")?;
        Ok(Some(pointer))
    }

    /// Renames `staging:{day}` to `published:{day}`, then points `meta:latest` at it.
    ///
    /// The two steps are not one transaction. A failed pointer write is reported as
    /// [`Promotion::PointerStale`] and left for the watchdog to repair.
    pub async fn promote(&self, pointer: &LatestPointer) -> anyhow::Result<Promotion> {
        let day = pointer.day;
        let moved = self
            .blobs
            .rename(&staging_key(day), &published_key(day))
            .await
            .with_context(|| format!("promote staging -> published failed (day={day})"))?;
        if !moved {
            tracing::warn!(%day, "no staging snapshot to promote");
            return Ok(Promotion::NothingToPublish);
        }

        let write = match serde_json::to_string(pointer) {
            Ok(blob) => self.blobs.set(META_LATEST_KEY, &blob).await,
            Err(err) => Err(err.into()),
        };

        match write {
            Ok(()) => Ok(Promotion::Promoted),
            Err(err) => {
                tracing::error!(
                    %day,
                    error = %format!("{err:#}"),
                    "published snapshot but meta:latest update failed"
                );
                Ok(Promotion::PointerStale {
                    error: format!("{err:#}"),
                })
            }
        }
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<DailySnapshot>> {
        let Some(blob) = self.blobs.get(key).await? else {
            return Ok(None);
        };
        let snapshot = DailySnapshot::from_blob(&blob)
            .with_context(|| format!("invalid snapshot blob (key={key})"))?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::snapshot::Coverage;
    use crate::storage::blob::MemoryBlobStore;
    use chrono::Utc;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 30).unwrap()
    }

    fn pointer() -> LatestPointer {
        LatestPointer {
            day: day(),
            published_at: Utc::now(),
            coverage: Coverage::default(),
        }
    }

    #[test]
    fn keys_are_namespaced_per_day() {
        assert_eq!(staging_key(day()), "staging:2026-07-30");
        assert_eq!(published_key(day()), "published:2026-07-30");
    }

    #[tokio::test]
    async fn published_copy_survives_later_staging_writes() {
        let store = SnapshotStore::new(Arc::new(MemoryBlobStore::new()));
        let mut snap = DailySnapshot::empty(day());
        snap.record_mut("AAPL").last_price = Some(201.5);
        let gated_blob = store.save_staging(&snap).await.unwrap();

        assert_eq!(store.promote(&pointer()).await.unwrap(), Promotion::Promoted);

        snap.record_mut("AAPL").last_price = Some(1.0);
        snap.record_mut("MSFT");
        store.save_staging(&snap).await.unwrap();

        let published = store.load_published_raw(day()).await.unwrap().unwrap();
        assert_eq!(published, gated_blob);
        assert_eq!(store.load_latest().await.unwrap().unwrap().day, day());
    }

    #[tokio::test]
    async fn promote_without_staging_publishes_nothing() {
        let store = SnapshotStore::new(Arc::new(MemoryBlobStore::new()));
        assert_eq!(
            store.promote(&pointer()).await.unwrap(),
            Promotion::NothingToPublish
        );
        assert!(store.load_published(day()).await.unwrap().is_none());
        assert!(store.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pointer_failure_leaves_published_in_place() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.fail_sets_on(META_LATEST_KEY);
        let store = SnapshotStore::new(blobs);
        store.save_staging(&DailySnapshot::empty(day())).await.unwrap();

        let outcome = store.promote(&pointer()).await.unwrap();
        assert!(matches!(outcome, Promotion::PointerStale { .. }));
        assert!(store.load_published(day()).await.unwrap().is_some());
        assert!(store.load_latest().await.unwrap().is_none());
    }
}
