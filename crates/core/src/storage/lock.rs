use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;

// Advisory locks are scoped to the Postgres session, so the guard pins the connection that took
// the lock. Used as a cross-process guard against two writers for the same day.
const LOCK_NAMESPACE: i64 = 0x4541_524E_4741; // "EARNGA"

fn lock_key_for_day(day: NaiveDate) -> i64 {
    LOCK_NAMESPACE ^ i64::from(day.num_days_from_ce())
}

pub struct DayLockGuard {
    conn: PoolConnection<Postgres>,
    key: i64,
    day: NaiveDate,
}

impl DayLockGuard {
    pub fn day(&self) -> NaiveDate {
        self.day
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        let key = self.key;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .persistent(false)
            .bind(key)
            .execute(&mut *self.conn)
            .await
            .with_context(|| format!("failed to release advisory lock (key={key})"))?;
        Ok(())
    }
}

/// Returns `None` when another session already holds the lock for `day`.
pub async fn try_acquire_day_lock(
    pool: &sqlx::PgPool,
    day: NaiveDate,
) -> anyhow::Result<Option<DayLockGuard>> {
    let key = lock_key_for_day(day);
    let mut conn = pool
        .acquire()
        .await
        .context("acquire connection for advisory lock failed")?;

    let acquired: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(key)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("failed to acquire advisory lock (key={key})"))?;

    if !acquired.0 {
        return Ok(None);
    }
    Ok(Some(DayLockGuard { conn, key, day }))
}
