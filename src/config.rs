// Runtime settings

//! Layered settings for the router.
//!
//! Sources, lowest precedence first:
//!
//! 1. serde defaults on [`Settings`]
//! 2. an optional TOML/JSON/YAML file
//! 3. `ROUTER__*` environment variables (`ROUTER__CATALOG__CACHE_TTL_MS=500`)
//!
//! Endpoint-level policies always win over the delivery defaults here; the
//! defaults only apply to endpoints that leave a policy unset.

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::models::{BreakerPolicy, RateLimitPolicy, RetryPolicy};
use crate::Result;

/// What to do with an attempt that exceeds the rate limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for capacity, up to `max_queue_wait_ms`
    #[default]
    Queue,
    /// Fail the attempt immediately
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Read cache lifetime; 0 disables caching
    pub cache_ttl_ms: u64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self { cache_ttl_ms: 5_000 }
    }
}

impl CatalogSettings {
    pub fn cache_ttl(&self) -> Option<Duration> {
        match self.cache_ttl_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
    /// No limit unless configured here or on the endpoint
    pub rate_limit: Option<RateLimitPolicy>,
    pub overflow: OverflowPolicy,
    pub max_queue_wait_ms: u64,
    pub max_concurrent_per_endpoint: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
            rate_limit: None,
            overflow: OverflowPolicy::Queue,
            max_queue_wait_ms: 30_000,
            max_concurrent_per_endpoint: 1,
        }
    }
}

impl DeliverySettings {
    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    /// Service label attached to tracking log lines
    pub service_name: String,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            service_name: "middleware-esb".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: Option<String>,
    pub catalog: CatalogSettings,
    pub delivery: DeliverySettings,
    pub tracking: TrackingSettings,
}

impl Settings {
    /// Load settings from an optional file plus the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::from_builder(Self::builder(file))
    }

    fn builder(file: Option<&Path>) -> ::config::ConfigBuilder<::config::builder::DefaultState> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        builder.add_source(
            Environment::with_prefix("ROUTER")
                .prefix_separator("__")
                .separator("__"),
        )
    }

    fn from_builder(
        builder: ::config::ConfigBuilder<::config::builder::DefaultState>,
    ) -> Result<Self> {
        let settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Filter directive for `tracing_subscriber::EnvFilter`
    pub fn log_filter(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.delivery.retry.max_attempts, 3);
        assert_eq!(settings.delivery.breaker.threshold, 5);
        assert_eq!(settings.delivery.overflow, OverflowPolicy::Queue);
        assert_eq!(settings.delivery.max_concurrent_per_endpoint, 1);
        assert_eq!(settings.catalog.cache_ttl(), Some(Duration::from_millis(5_000)));
        assert_eq!(settings.log_filter(), "info");
    }

    #[test]
    fn test_overrides_are_layered_over_defaults() {
        let builder = Settings::builder(None)
            .set_override("catalog.cache_ttl_ms", 0)
            .unwrap()
            .set_override("delivery.overflow", "reject")
            .unwrap()
            .set_override("log_level", "debug")
            .unwrap();
        let settings = Settings::from_builder(builder).unwrap();

        assert_eq!(settings.catalog.cache_ttl(), None);
        assert_eq!(settings.delivery.overflow, OverflowPolicy::Reject);
        assert_eq!(settings.delivery.max_queue_wait_ms, 30_000);
        assert_eq!(settings.log_filter(), "debug");
    }
}
