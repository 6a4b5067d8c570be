use crate::domain::fallback::FallbackPolicy;
use crate::domain::snapshot::ReportTime;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One ticker's price facts as returned by a price provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub ticker: String,
    pub last_price: Option<f64>,
    pub market_cap: Option<i64>,
    /// Trading day the quote belongs to.
    pub as_of: NaiveDate,
    pub source: String,
}

/// One ticker's earnings schedule and EPS/revenue facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsRevReport {
    pub ticker: String,
    pub report_time: Option<ReportTime>,
    pub eps_estimate: Option<f64>,
    pub eps_actual: Option<f64>,
    pub revenue_estimate: Option<i64>,
    pub revenue_actual: Option<i64>,
    pub source: String,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
}

/// Wire shape of `GET {base}/v1/prices?ticker=..&day=..`.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceResponse {
    pub ticker: String,
    pub last_price: Option<f64>,
    #[serde(default)]
    pub market_cap: Option<i64>,
    pub as_of: NaiveDate,
}

/// Wire shape of `GET {base}/v1/earnings?ticker=..&day=..`.
#[derive(Debug, Clone, Deserialize)]
pub struct EpsRevResponse {
    pub ticker: String,
    pub day: NaiveDate,
    #[serde(default)]
    pub hour: Option<String>,
    #[serde(default)]
    pub eps_estimate: Option<f64>,
    #[serde(default)]
    pub eps_actual: Option<f64>,
    #[serde(default)]
    pub revenue_estimate: Option<i64>,
    #[serde(default)]
    pub revenue_actual: Option<i64>,
}
