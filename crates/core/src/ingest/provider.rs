use crate::config::Settings;
use crate::domain::fallback::FallbackPolicy;
use crate::domain::snapshot::ReportTime;
use crate::ingest::types::{EpsRevReport, EpsRevResponse, PriceQuote, PriceResponse};
use crate::retry::FetchError;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use std::time::Duration;

const PRICES_PATH: &str = "/v1/prices";
const EARNINGS_PATH: &str = "/v1/earnings";

#[async_trait::async_trait]
pub trait PriceProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch_price(&self, ticker: &str, day: NaiveDate) -> Result<PriceQuote, FetchError>;
}

#[async_trait::async_trait]
pub trait EpsRevProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn fetch_eps_rev(&self, ticker: &str, day: NaiveDate)
        -> Result<EpsRevReport, FetchError>;
}

/// Single-attempt JSON GET client; retries belong to the caller.
#[derive(Debug, Clone)]
pub struct HttpJsonProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    path: String,
}

impl HttpJsonProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        path: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build data provider http client")?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key,
            path: path.to_string(),
        })
    }

    fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn headers(&self) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(api_key)
                .map_err(|e| FetchError::Connection(format!("invalid api key header: {e}")))?;
            headers.insert("x-api-key", value);
        }
        Ok(headers)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        ticker: &str,
        day: NaiveDate,
    ) -> Result<T, FetchError> {
        let res = self
            .http
            .get(self.url())
            .headers(self.headers()?)
            .query(&[("ticker", ticker.to_string()), ("day", day.to_string())])
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;

        let status = res.status();
        let text = res.text().await.map_err(|e| FetchError::from_reqwest(&e))?;

        if !status.is_success() {
            return Err(FetchError::from_status(status, text));
        }

        serde_json::from_str::<T>(&text)
            .map_err(|e| FetchError::Malformed(format!("{e}: {text}")))
    }
}

#[derive(Debug, Clone)]
pub struct HttpPriceProvider {
    inner: HttpJsonProvider,
}

impl HttpPriceProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let inner = HttpJsonProvider::new(
            settings.require_price_provider_base_url()?,
            settings.data_provider_api_key.clone(),
            PRICES_PATH,
            settings.data_provider_timeout,
        )?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl PriceProvider for HttpPriceProvider {
    fn provider_name(&self) -> &'static str {
        "http_prices"
    }

    async fn fetch_price(&self, ticker: &str, day: NaiveDate) -> Result<PriceQuote, FetchError> {
        let resp: PriceResponse = self.inner.get_json(ticker, day).await?;
        quote_from_response(resp, ticker, day, self.provider_name())
    }
}

#[derive(Debug, Clone)]
pub struct HttpEpsRevProvider {
    inner: HttpJsonProvider,
    fallback_policy: FallbackPolicy,
}

impl HttpEpsRevProvider {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let inner = HttpJsonProvider::new(
            settings.require_eps_rev_provider_base_url()?,
            settings.data_provider_api_key.clone(),
            EARNINGS_PATH,
            settings.data_provider_timeout,
        )?;
        Ok(Self {
            inner,
            fallback_policy: settings.eps_fallback_policy,
        })
    }
}

#[async_trait::async_trait]
impl EpsRevProvider for HttpEpsRevProvider {
    fn provider_name(&self) -> &'static str {
        "http_earnings"
    }

    async fn fetch_eps_rev(
        &self,
        ticker: &str,
        day: NaiveDate,
    ) -> Result<EpsRevReport, FetchError> {
        let resp: EpsRevResponse = self.inner.get_json(ticker, day).await?;
        report_from_response(resp, ticker, day, self.provider_name(), self.fallback_policy)
    }
}

fn quote_from_response(
    resp: PriceResponse,
    ticker: &str,
    day: NaiveDate,
    source: &str,
) -> Result<PriceQuote, FetchError> {
    if !resp.ticker.eq_ignore_ascii_case(ticker) {
        return Err(FetchError::Malformed(format!(
            "ticker mismatch: requested {ticker}, got {}",
            resp.ticker
        )));
    }
    if resp.as_of > day {
        return Err(FetchError::Malformed(format!(
            "quote as_of {} is after requested day {day}",
            resp.as_of
        )));
    }
    if let Some(price) = resp.last_price {
        if !price.is_finite() || price < 0.0 {
            return Err(FetchError::Malformed(format!("invalid last_price {price}")));
        }
    }

    Ok(PriceQuote {
        ticker: ticker.to_string(),
        last_price: resp.last_price,
        market_cap: resp.market_cap,
        as_of: resp.as_of,
        source: source.to_string(),
    })
}

fn report_from_response(
    resp: EpsRevResponse,
    ticker: &str,
    day: NaiveDate,
    source: &str,
    fallback_policy: FallbackPolicy,
) -> Result<EpsRevReport, FetchError> {
    if !resp.ticker.eq_ignore_ascii_case(ticker) {
        return Err(FetchError::Malformed(format!(
            "ticker mismatch: requested {ticker}, got {}",
            resp.ticker
        )));
    }
    if resp.day != day {
        return Err(FetchError::Malformed(format!(
            "earnings day mismatch: expected {day}, got {}",
            resp.day
        )));
    }

    let report_time = match resp.hour.as_deref() {
        None => None,
        Some(code) => match ReportTime::parse(code) {
            Some(t) => Some(t),
            None => {
                tracing::debug!(ticker, code, "unrecognized report hour code");
                None
            }
        },
    };

    Ok(EpsRevReport {
        ticker: ticker.to_string(),
        report_time,
        eps_estimate: resp.eps_estimate,
        eps_actual: resp.eps_actual,
        revenue_estimate: resp.revenue_estimate,
        revenue_actual: resp.revenue_actual,
        source: source.to_string(),
        fallback_policy,
    })
}
