use anyhow::Context;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};

/// US Eastern standard time. Override with `MARKET_UTC_OFFSET_MINUTES` during DST.
pub const DEFAULT_MARKET_UTC_OFFSET_MINUTES: i32 = -5 * 60;

pub fn market_offset(offset_minutes: i32) -> anyhow::Result<FixedOffset> {
    offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .with_context(|| format!("invalid market UTC offset: {offset_minutes} minutes"))
}

/// The earnings day: an explicit `YYYY-MM-DD` argument, else today's market-local date.
pub fn resolve_day(
    day_arg: Option<&str>,
    now_utc: DateTime<Utc>,
    offset: FixedOffset,
) -> anyhow::Result<NaiveDate> {
    if let Some(s) = day_arg {
        return NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .with_context(|| format!("invalid day (expected YYYY-MM-DD): {s}"));
    }
    Ok(now_utc.with_timezone(&offset).date_naive())
}

pub fn local_time(now_utc: DateTime<Utc>, offset: FixedOffset) -> NaiveTime {
    now_utc.with_timezone(&offset).time()
}

/// Parses `HH:MM` (24h).
pub fn parse_hhmm(s: &str) -> anyhow::Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("invalid time of day (expected HH:MM): {s}"))
}
