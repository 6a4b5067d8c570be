use anyhow::Context;
use std::collections::HashMap;

/// Minimal key/value blob store backing staging and published snapshots.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, blob: &str) -> anyhow::Result<()>;

    /// Atomically moves `src` to `dest`, replacing any existing `dest`.
    ///
    /// Returns `false` without touching `dest` when `src` does not exist.
    async fn rename(&self, src: &str, dest: &str) -> anyhow::Result<bool>;

    async fn delete(&self, key: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct PgBlobStore {
    pool: sqlx::PgPool,
}

impl PgBlobStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl BlobStore for PgBlobStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT blob FROM snapshot_blobs WHERE key = $1")
                .persistent(false)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("select snapshot_blobs failed (key={key})"))?;
        Ok(row.map(|(blob,)| blob))
    }

    async fn set(&self, key: &str, blob: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO snapshot_blobs (key, blob, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET blob = EXCLUDED.blob, updated_at = now()",
        )
        .persistent(false)
        .bind(key)
        .bind(blob)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert snapshot_blobs failed (key={key})"))?;
        Ok(())
    }

    async fn rename(&self, src: &str, dest: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await.context("begin transaction failed")?;

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT key FROM snapshot_blobs WHERE key = $1 FOR UPDATE")
                .persistent(false)
                .bind(src)
                .fetch_optional(&mut *tx)
                .await
                .with_context(|| format!("lock snapshot_blobs row failed (key={src})"))?;

        if exists.is_none() {
            tx.rollback().await.context("rollback transaction failed")?;
            return Ok(false);
        }

        if src != dest {
            sqlx::query("DELETE FROM snapshot_blobs WHERE key = $1")
                .persistent(false)
                .bind(dest)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("delete rename target failed (key={dest})"))?;

            sqlx::query("UPDATE snapshot_blobs SET key = $2, updated_at = now() WHERE key = $1")
                .persistent(false)
                .bind(src)
                .bind(dest)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("rename snapshot_blobs failed ({src} -> {dest})"))?;
        }

        tx.commit().await.context("commit transaction failed")?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM snapshot_blobs WHERE key = $1")
            .persistent(false)
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete snapshot_blobs failed (key={key})"))?;
        Ok(res.rows_affected() > 0)
    }
}

/// Process-local blob store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: tokio::sync::Mutex<HashMap<String, String>>,
    failing_keys: std::sync::Mutex<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `set` on `key` fail, for exercising partial-promotion paths.
    pub fn fail_sets_on(&self, key: &str) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.push(key.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.clear();
        }
    }

    fn should_fail(&self, key: &str) -> bool {
        self.failing_keys
            .lock()
            .map(|keys| keys.iter().any(|k| k == key))
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, blob: &str) -> anyhow::Result<()> {
        anyhow::ensure!(!self.should_fail(key), "injected write failure (key={key})");
        self.blobs
            .lock()
            .await
            .insert(key.to_string(), blob.to_string());
        Ok(())
    }

    async fn rename(&self, src: &str, dest: &str) -> anyhow::Result<bool> {
        let mut blobs = self.blobs.lock().await;
        let Some(blob) = blobs.remove(src) else {
            return Ok(false);
        };
        blobs.insert(dest.to_string(), blob);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.blobs.lock().await.remove(key).is_some())
    }
}
