use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "DISPATCHQ_";

const DEFAULT_DB_PATH: &str = "dispatchq.db";
const DEFAULT_STALE_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

/// Settings read from `DISPATCHQ_*` environment variables.
///
/// Numeric settings are kept as raw strings and parsed on access, so a malformed value falls
/// back to its default instead of failing the whole load.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// `None` opens a private in-memory database.
    pub db_path: Option<String>,
    pub delay_seconds: Option<String>,
    pub retry_count: Option<String>,
    pub stale_timeout_seconds: Option<String>,
    pub sweep_interval_seconds: Option<String>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> eyre::Result<Self> {
        let mut config: Self = envy::prefixed(ENV_PREFIX).from_iter(vars)?;

        if config.db_path.is_none() {
            config.db_path = Some(DEFAULT_DB_PATH.to_owned());
        }

        Ok(config)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let retries = numeric_or(
            "retry_count",
            self.retry_count.as_deref(),
            RetryPolicy::DEFAULT_RETRIES.into(),
        );
        let delay = numeric_or(
            "delay_seconds",
            self.delay_seconds.as_deref(),
            RetryPolicy::DEFAULT_DELAY.as_secs(),
        );

        RetryPolicy::new(
            u32::try_from(retries).unwrap_or(u32::MAX),
            Duration::from_secs(delay),
        )
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(numeric_or(
            "stale_timeout_seconds",
            self.stale_timeout_seconds.as_deref(),
            DEFAULT_STALE_TIMEOUT_SECONDS,
        ))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(numeric_or(
            "sweep_interval_seconds",
            self.sweep_interval_seconds.as_deref(),
            DEFAULT_SWEEP_INTERVAL_SECONDS,
        ))
    }
}

fn numeric_or(name: &str, raw: Option<&str>, default: u64) -> u64 {
    let Some(raw) = raw else {
        return default;
    };

    raw.trim().parse().unwrap_or_else(|_| {
        tracing::warn!("Ignoring non-numeric {name} {raw:?}, using {default}");
        default
    })
}
