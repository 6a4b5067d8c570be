pub mod coverage;
pub mod domain;
pub mod gate;
pub mod ingest;
pub mod pipeline;
pub mod retry;
pub mod storage;
pub mod time;
pub mod watchdog;

pub mod config {
    use crate::domain::fallback::FallbackPolicy;
    use crate::gate::DqThresholds;
    use crate::pipeline::BatchingOptions;
    use crate::retry::RetryPolicy;
    use crate::time::market::{self, DEFAULT_MARKET_UTC_OFFSET_MINUTES};
    use crate::watchdog::WatchdogPolicy;
    use anyhow::{anyhow, Context};
    use chrono::FixedOffset;
    use std::fmt::Display;
    use std::str::FromStr;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub database_url: Option<String>,
        pub sentry_dsn: Option<String>,
        pub app_env: String,
        pub price_provider_base_url: Option<String>,
        pub eps_rev_provider_base_url: Option<String>,
        pub data_provider_api_key: Option<String>,
        pub data_provider_timeout: Duration,
        pub eps_fallback_policy: FallbackPolicy,
        pub worker_tag: String,
        /// Fallback ticker set when the store has no rows for the day yet.
        pub universe: Vec<String>,
        pub market_offset: FixedOffset,
        pub pipeline: PipelineSettings,
        pub watchdog: WatchdogSettings,
    }

    #[derive(Debug, Clone)]
    pub struct PipelineSettings {
        pub thresholds: DqThresholds,
        pub retry: RetryPolicy,
        pub batching: BatchingOptions,
    }

    #[derive(Debug, Clone)]
    pub struct WatchdogSettings {
        pub policy: WatchdogPolicy,
        pub interval: Duration,
        pub tick_timeout: Duration,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Self::from_lookup(|key| std::env::var(key).ok())
        }

        pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
            let env = Env { lookup: &lookup };

            let app_env = env.string("APP_ENV").unwrap_or_else(|| "development".to_string());

            let mut thresholds = DqThresholds::for_environment(&app_env);
            if let Some(v) = env.percent("DQ_MIN_SCHEDULE_COVERAGE")? {
                thresholds.schedule = v;
            }
            if let Some(v) = env.percent("DQ_MIN_PRICE_COVERAGE")? {
                thresholds.price = v;
            }
            if let Some(v) = env.percent("DQ_MIN_EPS_REV_COVERAGE")? {
                thresholds.eps_rev = v;
            }

            let defaults = RetryPolicy::default();
            let retry = RetryPolicy {
                max_retries: env.parse("FETCH_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
                base_delay: env.millis("FETCH_BASE_DELAY_MS")?.unwrap_or(defaults.base_delay),
                max_delay: env.millis("FETCH_MAX_DELAY_MS")?.unwrap_or(defaults.max_delay),
                backoff_multiplier: env
                    .parse("FETCH_BACKOFF_MULTIPLIER")?
                    .unwrap_or(defaults.backoff_multiplier),
                jitter: env.millis("FETCH_JITTER_MS")?.unwrap_or(defaults.jitter),
            };
            anyhow::ensure!(
                retry.backoff_multiplier >= 1.0,
                "FETCH_BACKOFF_MULTIPLIER must be >= 1.0 (got {})",
                retry.backoff_multiplier
            );

            let batch_defaults = BatchingOptions::default();
            let batching = BatchingOptions {
                batch_size: env.parse("FETCH_BATCH_SIZE")?.unwrap_or(batch_defaults.batch_size),
                inter_batch_delay: env
                    .millis("FETCH_INTER_BATCH_DELAY_MS")?
                    .unwrap_or(batch_defaults.inter_batch_delay),
            };
            anyhow::ensure!(batching.batch_size > 0, "FETCH_BATCH_SIZE must be > 0");

            let offset_minutes = env
                .parse("MARKET_UTC_OFFSET_MINUTES")?
                .unwrap_or(DEFAULT_MARKET_UTC_OFFSET_MINUTES);
            let market_offset = market::market_offset(offset_minutes)?;

            let policy_defaults = WatchdogPolicy::with_offset(market_offset);
            let freshness = match env.parse::<i64>("WATCHDOG_FRESHNESS_MINUTES")? {
                Some(m) => {
                    anyhow::ensure!(m >= 0, "WATCHDOG_FRESHNESS_MINUTES must be >= 0 (got {m})");
                    chrono::Duration::try_minutes(m)
                        .context("WATCHDOG_FRESHNESS_MINUTES out of range")?
                }
                None => policy_defaults.freshness,
            };
            let policy = WatchdogPolicy {
                freshness,
                price_cutoff: match env.string("WATCHDOG_PRICE_CUTOFF") {
                    Some(s) => market::parse_hhmm(&s).context("WATCHDOG_PRICE_CUTOFF")?,
                    None => policy_defaults.price_cutoff,
                },
                price_floor: env
                    .percent("WATCHDOG_PRICE_FLOOR")?
                    .unwrap_or(policy_defaults.price_floor),
                eps_rev_late_cutoff: match env.string("WATCHDOG_EPS_REV_LATE_CUTOFF") {
                    Some(s) => market::parse_hhmm(&s).context("WATCHDOG_EPS_REV_LATE_CUTOFF")?,
                    None => policy_defaults.eps_rev_late_cutoff,
                },
                eps_rev_late_floor: env
                    .percent("WATCHDOG_EPS_REV_LATE_FLOOR")?
                    .unwrap_or(policy_defaults.eps_rev_late_floor),
                market_offset,
            };

            let interval = Duration::from_secs(env.parse("WATCHDOG_INTERVAL_SECS")?.unwrap_or(900));
            let tick_timeout =
                Duration::from_secs(env.parse("WATCHDOG_TICK_TIMEOUT_SECS")?.unwrap_or(600));
            anyhow::ensure!(!interval.is_zero(), "WATCHDOG_INTERVAL_SECS must be > 0");
            anyhow::ensure!(!tick_timeout.is_zero(), "WATCHDOG_TICK_TIMEOUT_SECS must be > 0");

            let eps_fallback_policy = match env.string("EPS_FALLBACK_POLICY") {
                Some(s) => FallbackPolicy::parse(&s)
                    .ok_or_else(|| anyhow!("EPS_FALLBACK_POLICY: unknown policy {s:?}"))?,
                None => FallbackPolicy::default(),
            };

            Ok(Self {
                database_url: env.string("DATABASE_URL"),
                sentry_dsn: env.string("SENTRY_DSN"),
                app_env,
                price_provider_base_url: env.string("PRICE_PROVIDER_BASE_URL"),
                eps_rev_provider_base_url: env.string("EPS_REV_PROVIDER_BASE_URL"),
                data_provider_api_key: env.string("DATA_PROVIDER_API_KEY"),
                data_provider_timeout: Duration::from_secs(
                    env.parse("DATA_PROVIDER_TIMEOUT_SECS")?.unwrap_or(10),
                ),
                eps_fallback_policy,
                worker_tag: env
                    .string("WORKER_TAG")
                    .unwrap_or_else(|| "earngate-worker".to_string()),
                universe: env
                    .string("EARNINGS_TICKERS")
                    .map(|s| parse_ticker_list(&s))
                    .unwrap_or_default(),
                market_offset,
                pipeline: PipelineSettings {
                    thresholds,
                    retry,
                    batching,
                },
                watchdog: WatchdogSettings {
                    policy,
                    interval,
                    tick_timeout,
                },
            })
        }

        pub fn require_database_url(&self) -> anyhow::Result<&str> {
            self.database_url
                .as_deref()
                .context("DATABASE_URL is required")
        }

        pub fn require_price_provider_base_url(&self) -> anyhow::Result<&str> {
            self.price_provider_base_url
                .as_deref()
                .context("PRICE_PROVIDER_BASE_URL is required")
        }

        pub fn require_eps_rev_provider_base_url(&self) -> anyhow::Result<&str> {
            self.eps_rev_provider_base_url
                .as_deref()
                .context("EPS_REV_PROVIDER_BASE_URL is required")
        }

        pub fn is_production(&self) -> bool {
            self.app_env.eq_ignore_ascii_case("production")
        }
    }

    /// Comma/whitespace separated tickers, upper-cased and de-duplicated.
    pub fn parse_ticker_list(s: &str) -> Vec<String> {
        let raw: Vec<String> = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::to_string)
            .collect();
        crate::pipeline::normalize_tickers(&raw)
    }

    struct Env<'a> {
        lookup: &'a dyn Fn(&str) -> Option<String>,
    }

    impl Env<'_> {
        fn string(&self, key: &str) -> Option<String> {
            (self.lookup)(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }

        fn parse<T>(&self, key: &str) -> anyhow::Result<Option<T>>
        where
            T: FromStr,
            T::Err: Display,
        {
            self.string(key)
                .map(|v| {
                    v.parse::<T>()
                        .map_err(|e| anyhow!("{key}: invalid value {v:?}: {e}"))
                })
                .transpose()
        }

        fn millis(&self, key: &str) -> anyhow::Result<Option<Duration>> {
            Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
        }

        fn percent(&self, key: &str) -> anyhow::Result<Option<u8>> {
            let v = self.parse::<u8>(key)?;
            if let Some(p) = v {
                anyhow::ensure!(p <= 100, "{key} must be within 0..=100 (got {p})");
            }
            Ok(v)
        }
    }

}
