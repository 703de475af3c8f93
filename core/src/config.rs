//! Runtime configuration.
//!
//! Every knob has a default matching the warehouse's published pricing, so
//! `FerryConfig::default()` is usable as-is. Configurations can also be read
//! from JSON.

use ferry_common::{CommonError, StorageBackend};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// One mebibyte.
pub const MEGA: u64 = 1024 * 1024;

/// Billing granularity of the warehouse: 10 MiB blocks.
pub const BILLING_BLOCK_BYTES: u64 = 10 * MEGA;

/// Price of one 10 MiB block at 6 currency units per TiB.
pub const DEFAULT_PRICE_PER_10MIB: f64 = 6.0 / 1024.0 / 1024.0 * 10.0;

/// Queries running longer than this are logged at warning level.
pub const DEFAULT_SLOW_QUERY_THRESHOLD_SECS: f64 = 60.0;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FerryConfig {
    /// Warehouse location (region) queries and loads run in.
    pub location: String,
    pub pricing: PricingConfig,
    pub retry: RetryConfig,
    pub storage: StorageBackend,
    pub bigquery: BigQueryConfig,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            location: "EU".to_string(),
            pricing: PricingConfig::default(),
            retry: RetryConfig::default(),
            storage: StorageBackend::default(),
            bigquery: BigQueryConfig::default(),
        }
    }
}

impl FerryConfig {
    pub fn from_json_str(json: &str) -> ferry_common::Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            CommonError::configuration_error_with_source("Failed to parse configuration", e)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ferry_common::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            CommonError::configuration_error_with_source(
                format!("Failed to read configuration file {}", path.display()),
                e,
            )
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> ferry_common::Result<()> {
        if self.pricing.price_per_10mib < 0.0 || !self.pricing.price_per_10mib.is_finite() {
            return Err(CommonError::configuration_error(
                "pricing.price_per_10mib must be a finite, non-negative number",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CommonError::configuration_error(
                "retry.max_attempts must be at least 1",
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(CommonError::configuration_error(
                "retry.multiplier must be >= 1.0",
            ));
        }
        Ok(())
    }

    pub fn with_location<S: Into<String>>(mut self, location: S) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_pricing(mut self, pricing: PricingConfig) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_storage(mut self, storage: StorageBackend) -> Self {
        self.storage = storage;
        self
    }
}

/// Query cost metering.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    pub price_per_10mib: f64,
    pub slow_query_threshold_secs: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            price_per_10mib: DEFAULT_PRICE_PER_10MIB,
            slow_query_threshold_secs: DEFAULT_SLOW_QUERY_THRESHOLD_SECS,
        }
    }
}

impl PricingConfig {
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.slow_query_threshold_secs.max(0.0))
    }
}

/// Backoff around source materialization.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub max_elapsed_secs: u64,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            max_elapsed_secs: 600,
            initial_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

/// BigQuery REST endpoint settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BigQueryConfig {
    pub endpoint: String,
    pub poll_interval_ms: u64,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://bigquery.googleapis.com".to_string(),
            poll_interval_ms: 1000,
        }
    }
}
