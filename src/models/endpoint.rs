// Delivery target configuration

//! # Endpoint Models
//!
//! An [`Endpoint`] describes where and how a canonical event is delivered to a
//! destination agent, together with the reliability policies that the
//! delivery gate enforces for it:
//!
//! - [`RetryPolicy`]: how many attempts and how long to wait between them
//! - [`RateLimitPolicy`]: how many attempts per interval
//! - [`BreakerPolicy`]: when to stop calling a failing destination
//!
//! Credentials are referenced by id only. Secret material never lives here.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::{ActionPattern, Versioned};

/// Transport used to reach the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportProtocol {
    Rest,
    Soap,
    Graphql,
    Amqp,
    Kafka,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub timeout_ms: Option<u64>,
}

/// HTTP details when the transport is REST/SOAP/GraphQL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    pub method: HttpMethod,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub headers: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Broker details when the transport is AMQP/Kafka
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    pub topic: Option<String>,
    pub queue: Option<String>,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub partition_key: Option<String>,
    pub message_key: Option<String>,
    pub properties: Option<Value>,
}

/// TLS options; certificates are references, not inline keys
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub reject_unauthorized: Option<bool>,
    pub ca_ref: Option<String>,
    pub cert_ref: Option<String>,
    pub key_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Fixed,
    #[default]
    Exponential,
}

/// Retry policy for transient delivery failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub delay_ms: u64,
    pub max_delay_ms: Option<u64>,
    /// Spread each delay by up to ±50%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential,
            delay_ms: 1_000,
            max_delay_ms: Some(60_000),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows failed attempt number `attempt` (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match self.strategy {
            RetryStrategy::Fixed => self.delay_ms,
            RetryStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor)
            }
        };
        let capped = match self.max_delay_ms {
            Some(max) if self.strategy == RetryStrategy::Exponential => millis.min(max),
            _ => millis,
        };
        Duration::from_millis(capped)
    }

    /// Base delay with jitter applied when the policy asks for it
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
        base.mul_f64(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitStrategy {
    FixedWindow,
    #[default]
    TokenBucket,
}

/// Attempts allowed per interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitPolicy {
    pub strategy: RateLimitStrategy,
    pub limit: u32,
    pub interval_ms: u64,
    /// Token bucket capacity; defaults to `limit`
    pub burst: Option<u32>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::TokenBucket,
            limit: 100,
            interval_ms: 1_000,
            burst: None,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerPolicy {
    /// Consecutive failures that open the circuit
    pub threshold: u32,
    /// How long the circuit stays open before probing
    pub open_ms: u64,
    /// Consecutive probe successes needed to close again
    pub half_open_max_attempts: u32,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            open_ms: 30_000,
            half_open_max_attempts: 1,
        }
    }
}

/// Delivery target for `(target agent, entity, action)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(alias = "targetAgent")]
    pub agent: String,

    pub entity: String,

    pub action: ActionPattern,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_active")]
    pub active: bool,

    pub transport_protocol: TransportProtocol,

    /// URI, broker address or bootstrap servers, depending on the transport
    pub endpoint: String,

    /// Reference to a stored credential
    #[serde(default)]
    pub credential_id: Option<String>,

    #[serde(default)]
    pub config: Option<EndpointConfig>,

    #[serde(default)]
    pub http_config: Option<HttpConfig>,

    #[serde(default)]
    pub queue_config: Option<QueueConfig>,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,

    #[serde(default)]
    pub breaker_policy: Option<BreakerPolicy>,

    #[serde(default)]
    pub max_concurrent_per_endpoint: Option<usize>,
}

impl Endpoint {
    pub fn new(agent: &str, entity: &str, action: &str, protocol: TransportProtocol, endpoint: &str) -> Self {
        Self {
            agent: agent.to_string(),
            entity: entity.to_string(),
            action: ActionPattern::parse(action),
            version: 1,
            active: true,
            transport_protocol: protocol,
            endpoint: endpoint.to_string(),
            credential_id: None,
            config: None,
            http_config: None,
            queue_config: None,
            tls: None,
            retry_policy: None,
            rate_limit: None,
            breaker_policy: None,
            max_concurrent_per_endpoint: None,
        }
    }

    /// Key that scopes breaker, limiter and concurrency state
    pub fn gate_key(&self) -> String {
        format!("{}/{}/{}", self.agent, self.entity, self.action)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.config
            .as_ref()
            .and_then(|config| config.timeout_ms)
            .map(Duration::from_millis)
    }

    pub fn series(&self) -> (String, String, String) {
        (self.agent.clone(), self.entity.clone(), self.action.to_string())
    }
}

impl Versioned for Endpoint {
    fn pattern(&self) -> &ActionPattern {
        &self.action
    }
    fn version(&self) -> u32 {
        self.version
    }
    fn is_active(&self) -> bool {
        self.active
    }
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}
