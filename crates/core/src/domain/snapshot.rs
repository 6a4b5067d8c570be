use crate::domain::fallback::{FallbackPolicy, FallbackRule};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One of the independently tracked data facets of a day's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Schedule,
    Price,
    EpsRev,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Schedule, Dimension::Price, Dimension::EpsRev];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Schedule => "schedule",
            Dimension::Price => "price",
            Dimension::EpsRev => "eps_rev",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer coverage percentages, each in `0..=100`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub schedule: u8,
    pub price: u8,
    pub eps_rev: u8,
}

impl Coverage {
    pub fn get(&self, dimension: Dimension) -> u8 {
        match dimension {
            Dimension::Schedule => self.schedule,
            Dimension::Price => self.price,
            Dimension::EpsRev => self.eps_rev,
        }
    }
}

/// When the company reports relative to the trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportTime {
    BeforeOpen,
    DuringMarket,
    AfterClose,
    /// The calendar lists the ticker without a time.
    NotSupplied,
}

impl ReportTime {
    pub fn is_known(self) -> bool {
        !matches!(self, ReportTime::NotSupplied)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportTime::BeforeOpen => "before_open",
            ReportTime::DuringMarket => "during_market",
            ReportTime::AfterClose => "after_close",
            ReportTime::NotSupplied => "not_supplied",
        }
    }

    /// Parses the common calendar codes (`bmo`, `dmh`, `amc`, `tns`) and their long forms.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bmo" | "before_open" | "pre-market" => Some(ReportTime::BeforeOpen),
            "dmh" | "during_market" => Some(ReportTime::DuringMarket),
            "amc" | "after_close" | "post-market" => Some(ReportTime::AfterClose),
            "tns" | "not_supplied" | "" => Some(ReportTime::NotSupplied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerRecord {
    pub ticker: String,

    #[serde(default)]
    pub report_time: Option<ReportTime>,

    #[serde(default)]
    pub last_price: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<i64>,
    #[serde(default)]
    pub price_as_of: Option<NaiveDate>,
    #[serde(default)]
    pub price_source: Option<String>,

    #[serde(default)]
    pub eps_estimate: Option<f64>,
    #[serde(default)]
    pub eps_actual: Option<f64>,
    #[serde(default)]
    pub revenue_estimate: Option<i64>,
    #[serde(default)]
    pub revenue_actual: Option<i64>,
    #[serde(default)]
    pub eps_rev_source: Option<String>,

    #[serde(default)]
    pub stale: bool,

    /// Dimensions for which the upstream did not know this ticker on its latest run.
    #[serde(default)]
    pub not_found: BTreeSet<Dimension>,

    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    #[serde(default)]
    pub applied_fallbacks: BTreeSet<FallbackRule>,
}

impl TickerRecord {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            report_time: None,
            last_price: None,
            market_cap: None,
            price_as_of: None,
            price_source: None,
            eps_estimate: None,
            eps_actual: None,
            revenue_estimate: None,
            revenue_actual: None,
            eps_rev_source: None,
            stale: false,
            not_found: BTreeSet::new(),
            fallback_policy: FallbackPolicy::default(),
            applied_fallbacks: BTreeSet::new(),
        }
    }

    pub fn has_schedule(&self) -> bool {
        self.report_time.is_some_and(ReportTime::is_known)
    }

    pub fn has_price(&self) -> bool {
        self.last_price.is_some()
    }

    pub fn has_eps_rev(&self) -> bool {
        let eps = self.eps_estimate.is_some() || self.eps_actual.is_some();
        let rev = self.revenue_estimate.is_some() || self.revenue_actual.is_some();
        eps && rev
    }

    pub fn satisfies(&self, dimension: Dimension) -> bool {
        match dimension {
            Dimension::Schedule => self.has_schedule(),
            Dimension::Price => self.has_price(),
            Dimension::EpsRev => self.has_eps_rev(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub day: NaiveDate,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub coverage: Coverage,
    #[serde(default)]
    pub records: BTreeMap<String, TickerRecord>,
    #[serde(default)]
    pub flags: BTreeSet<String>,
}

impl DailySnapshot {
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            published_at: None,
            coverage: Coverage::default(),
            records: BTreeMap::new(),
            flags: BTreeSet::new(),
        }
    }

    /// Returns the record for `ticker`, inserting an empty one if absent.
    pub fn record_mut(&mut self, ticker: &str) -> &mut TickerRecord {
        self.records
            .entry(ticker.to_string())
            .or_insert_with(|| TickerRecord::new(ticker))
    }

    pub fn to_blob(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_blob(blob: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(blob)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Staging,
    Published,
}

impl PublishStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PublishStatus::Staging => "staging",
            PublishStatus::Published => "published",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "staging" => Ok(PublishStatus::Staging),
            "published" => Ok(PublishStatus::Published),
            other => anyhow::bail!("unknown publish status: {other}"),
        }
    }
}

/// Durable per-day mirror of the staging coverage and publish state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMetadata {
    pub day: NaiveDate,
    pub coverage: Coverage,
    pub status: PublishStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Contents of `meta:latest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub day: NaiveDate,
    pub published_at: DateTime<Utc>,
    pub coverage: Coverage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trips_large_integers_and_floats_exactly() {
        let day = NaiveDate::from_ymd_opt(2026, 2, 3).unwrap();
        let mut snap = DailySnapshot::empty(day);
        let rec = snap.record_mut("NVDA");
        rec.market_cap = Some(4_321_987_654_321_987);
        rec.revenue_actual = Some(i64::MAX - 7);
        rec.last_price = Some(0.1 + 0.2);
        rec.eps_estimate = Some(1.234_567_890_123_456_7);
        rec.report_time = Some(ReportTime::AfterClose);
        snap.flags.insert("worker-a:price".to_string());

        let blob = snap.to_blob().unwrap();
        let back = DailySnapshot::from_blob(&blob).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.to_blob().unwrap(), blob);
    }

    #[test]
    fn eps_rev_needs_both_halves() {
        let mut rec = TickerRecord::new("AAPL");
        rec.eps_actual = Some(1.5);
        assert!(!rec.has_eps_rev());
        rec.revenue_estimate = Some(90_000_000_000);
        assert!(rec.has_eps_rev());
    }

    #[test]
    fn not_supplied_report_time_is_not_a_schedule() {
        let mut rec = TickerRecord::new("MSFT");
        rec.report_time = Some(ReportTime::NotSupplied);
        assert!(!rec.has_schedule());
        rec.report_time = ReportTime::parse("amc");
        assert!(rec.has_schedule());
    }
}
