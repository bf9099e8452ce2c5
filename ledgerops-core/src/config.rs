use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Environment variable prefix for every setting, e.g. `LEDGEROPS_LEASE_DURATION_SECONDS`.
pub const ENV_PREFIX: &str = "LEDGEROPS";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaseConfig {
    /// Lease time-to-live in seconds.
    pub lease_duration_seconds: u64,
    /// Number of acquisition attempts before giving up.
    pub lease_acquire_attempts: u32,
    /// Spacing between acquisition attempts; defaults to the lease duration.
    pub lease_retry_interval_seconds: Option<u64>,
    /// PostgreSQL connection string for the lease store. Falls back to `PG*` variables.
    pub store_url: Option<String>,
    /// `disable`, `prefer`, `require`, `verify-ca` or `verify-full`. Falls back to `PGSSLMODE`.
    pub store_ssl_mode: Option<String>,
    pub store_table: String,
    /// Log format: "compact" or "json".
    pub log_format: String,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_seconds: 20,
            lease_acquire_attempts: 10,
            lease_retry_interval_seconds: None,
            store_url: None,
            store_ssl_mode: None,
            store_table: "ledgerops_leases".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

impl LeaseConfig {
    /// Defaults overridden by `LEDGEROPS_*` process environment variables.
    pub fn load() -> anyhow::Result<Self> {
        Self::build(None)
    }

    /// Like [`Self::load`] but reading overrides from `env` instead of the process
    /// environment. Keys keep their prefix, e.g. `LEDGEROPS_STORE_TABLE`.
    pub fn load_from(env: HashMap<String, String>) -> anyhow::Result<Self> {
        Self::build(Some(env))
    }

    fn build(env: Option<HashMap<String, String>>) -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: LeaseConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(
            self.lease_retry_interval_seconds
                .unwrap_or(self.lease_duration_seconds),
        )
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_duration_seconds == 0 {
            bail!("lease_duration_seconds must be greater than zero");
        }
        if self.lease_acquire_attempts == 0 {
            bail!("lease_acquire_attempts must be at least 1");
        }
        if !is_plain_identifier(&self.store_table) {
            bail!("store_table {:?} is not a plain SQL identifier", self.store_table);
        }
        if !matches!(self.log_format.as_str(), "compact" | "json") {
            bail!("log_format must be \"compact\" or \"json\", got {:?}", self.log_format);
        }
        Ok(())
    }
}

pub(crate) fn is_plain_identifier(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
