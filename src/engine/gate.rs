// Delivery gate
// Circuit breaker, rate limiter, retry decision and concurrency slots per endpoint

//! # Delivery Gate
//!
//! Every dispatch attempt to an endpoint passes through the gate twice:
//! [`DeliveryGate::admit`] before the attempt and [`DeliveryGate::record`]
//! after it. Between attempts [`DeliveryGate::retry_decision`] says whether
//! and when to try again.
//!
//! ## Circuit Breaker
//!
//! ```text
//!            threshold consecutive failures
//!   Closed ───────────────────────────────────▶ Open
//!     ▲                                          │  openMs elapsed
//!     │ halfOpenMaxAttempts successes            ▼  (on next admission)
//!     └──────────────────────────────────── HalfOpen
//!                 any failure: back to Open, timer restarts
//! ```
//!
//! While open, admission fails fast with a circuit-open rejection. Those
//! rejections are counted apart from real delivery failures. Half-open does
//! not cap the number of probes in flight; concurrency slots already bound it.
//!
//! ## Rate Limiter
//!
//! `token-bucket` refills continuously at `limit / intervalMs` up to `burst`
//! (or `limit`). `fixed-window` allows `limit` attempts per `intervalMs`
//! window. An attempt over the limit is never dropped: it is told how long to
//! wait, or rejected when the overflow policy is `reject`.
//!
//! ## Shared State
//!
//! Breaker and limiter state lives behind [`GateStateStore`]. The in-memory
//! store gives per-process limits only; a store backed by a shared cache
//! makes them global without touching the gate logic. Time comes from a
//! [`Clock`] so tests can move it by hand.
//!
//! ## Rust Learning Notes:
//!
//! ### Closures Across a Trait Object
//! `GateStateStore::update` takes
//! `&mut (dyn for<'s> FnMut(&'s mut EndpointState) + Send)`. The store decides
//! how to lock and persist; the gate only describes the change. Results travel
//! back through variables the closure captures.
//!
//! The `for<'s>` bound matters under `#[async_trait]`: the macro names every
//! elided lifetime in the signature, which would tie the closure's argument to
//! the caller's borrows. A higher-ranked bound lets the store pass a borrow of
//! its own lock guard, however short-lived.
//!
//! ### Per-Key Locks
//! `DashMap<String, Arc<Mutex<EndpointState>>>` shards the map, and each
//! endpoint gets its own `tokio::sync::Mutex`. Two endpoints never contend, and
//! the map guard is released before awaiting the endpoint lock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{DeliverySettings, OverflowPolicy};
use crate::models::{
    AttemptOutcome, BreakerPolicy, Endpoint, ErrorClassification, RateLimitPolicy,
    RateLimitStrategy, RetryPolicy,
};
use crate::{Result, RouterError};

/// Source of "now" in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Runtime breaker state for one endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub opened_at_ms: Option<i64>,
}

impl BreakerState {
    /// `Err(remaining_ms)` while the circuit is open
    fn admit(&mut self, policy: &BreakerPolicy, now: i64) -> std::result::Result<(), u64> {
        if self.status != BreakerStatus::Open {
            return Ok(());
        }
        let elapsed = now - self.opened_at_ms.unwrap_or(now);
        let open_ms = policy.open_ms as i64;
        if elapsed >= open_ms {
            self.status = BreakerStatus::HalfOpen;
            self.half_open_successes = 0;
            Ok(())
        } else {
            Err((open_ms - elapsed) as u64)
        }
    }

    fn open(&mut self, now: i64) {
        self.status = BreakerStatus::Open;
        self.opened_at_ms = Some(now);
        self.half_open_successes = 0;
    }

    fn record_success(&mut self, policy: &BreakerPolicy) {
        match self.status {
            BreakerStatus::Closed => self.consecutive_failures = 0,
            BreakerStatus::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= policy.half_open_max_attempts.max(1) {
                    *self = BreakerState::default();
                }
            }
            // An attempt admitted before the circuit opened
            BreakerStatus::Open => {}
        }
    }

    /// Returns true when this failure opened the circuit
    fn record_failure(&mut self, policy: &BreakerPolicy, now: i64) -> bool {
        match self.status {
            BreakerStatus::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= policy.threshold.max(1) {
                    self.open(now);
                    true
                } else {
                    false
                }
            }
            BreakerStatus::HalfOpen => {
                self.consecutive_failures += 1;
                self.open(now);
                true
            }
            BreakerStatus::Open => false,
        }
    }
}

/// Runtime limiter state for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum LimiterState {
    TokenBucket { tokens: f64, last_refill_ms: i64 },
    FixedWindow { window_start_ms: i64, count: u32 },
}

impl LimiterState {
    fn fresh(policy: &RateLimitPolicy, now: i64) -> Self {
        match policy.strategy {
            RateLimitStrategy::TokenBucket => LimiterState::TokenBucket {
                tokens: bucket_capacity(policy),
                last_refill_ms: now,
            },
            RateLimitStrategy::FixedWindow => LimiterState::FixedWindow {
                window_start_ms: now,
                count: 0,
            },
        }
    }

    fn matches(&self, strategy: RateLimitStrategy) -> bool {
        matches!(
            (self, strategy),
            (LimiterState::TokenBucket { .. }, RateLimitStrategy::TokenBucket)
                | (LimiterState::FixedWindow { .. }, RateLimitStrategy::FixedWindow)
        )
    }

    /// Take one slot, or `Err(wait_ms)` until one is available
    fn try_acquire(&mut self, policy: &RateLimitPolicy, now: i64) -> std::result::Result<(), u64> {
        let interval = policy.interval_ms.max(1) as i64;
        match self {
            LimiterState::TokenBucket {
                tokens,
                last_refill_ms,
            } => {
                let capacity = bucket_capacity(policy);
                let limit = policy.limit as f64;
                let elapsed = (now - *last_refill_ms).max(0) as f64;
                *tokens = (*tokens + elapsed * limit / interval as f64).min(capacity);
                *last_refill_ms = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Ok(())
                } else if policy.limit == 0 {
                    Err(interval as u64)
                } else {
                    Err(((1.0 - *tokens) * interval as f64 / limit).ceil().max(1.0) as u64)
                }
            }
            LimiterState::FixedWindow {
                window_start_ms,
                count,
            } => {
                if now - *window_start_ms >= interval {
                    *window_start_ms = now;
                    *count = 0;
                }
                if *count < policy.limit {
                    *count += 1;
                    Ok(())
                } else {
                    Err((*window_start_ms + interval - now).max(1) as u64)
                }
            }
        }
    }
}

fn bucket_capacity(policy: &RateLimitPolicy) -> f64 {
    policy.burst.unwrap_or(policy.limit) as f64
}

/// Counters kept next to the breaker for operators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStats {
    pub successes: u64,
    /// Transient and fatal failures reported by the connector
    pub transport_failures: u64,
    pub business_rejections: u64,
    /// Attempts refused because the circuit was open
    pub circuit_open_rejections: u64,
    pub rate_limited: u64,
}

/// Everything the gate remembers about one endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointState {
    pub breaker: BreakerState,
    pub limiter: Option<LimiterState>,
    pub stats: GateStats,
}

/// Storage for per-endpoint gate state
///
/// `update` must apply the closure atomically with respect to other updates
/// of the same key.
#[async_trait]
pub trait GateStateStore: Send + Sync {
    async fn update(
        &self,
        key: &str,
        apply: &mut (dyn for<'s> FnMut(&'s mut EndpointState) + Send),
    ) -> Result<()>;

    async fn snapshot(&self, key: &str) -> Result<Option<EndpointState>>;
}

/// Process-local gate state
#[derive(Default)]
pub struct InMemoryGateStore {
    states: DashMap<String, Arc<Mutex<EndpointState>>>,
}

impl InMemoryGateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<EndpointState>> {
        self.states
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(EndpointState::default())))
            .value()
            .clone()
    }
}

#[async_trait]
impl GateStateStore for InMemoryGateStore {
    async fn update(
        &self,
        key: &str,
        apply: &mut (dyn for<'s> FnMut(&'s mut EndpointState) + Send),
    ) -> Result<()> {
        let slot = self.slot(key);
        let mut state = slot.lock().await;
        apply(&mut state);
        Ok(())
    }

    async fn snapshot(&self, key: &str) -> Result<Option<EndpointState>> {
        let slot = match self.states.get(key) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };
        let state = slot.lock().await;
        Ok(Some(state.clone()))
    }
}

/// Why admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    CircuitOpen { retry_after: Duration },
    RateLimited { retry_after: Duration },
}

impl Rejection {
    pub fn into_error(self, endpoint: &Endpoint) -> RouterError {
        match self {
            Rejection::CircuitOpen { retry_after } => RouterError::CircuitOpen {
                endpoint: endpoint.gate_key(),
                retry_after_ms: retry_after.as_millis() as u64,
            },
            Rejection::RateLimited { retry_after } => RouterError::RateLimited(format!(
                "{} is over its rate limit, retry after {}ms",
                endpoint.gate_key(),
                retry_after.as_millis()
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// Over the rate limit; try again after the delay
    Wait(Duration),
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

pub struct DeliveryGate {
    store: Arc<dyn GateStateStore>,
    clock: Arc<dyn Clock>,
    defaults: DeliverySettings,
    slots: DashMap<String, Arc<Semaphore>>,
}

impl DeliveryGate {
    /// In-memory state and the system clock
    pub fn new(defaults: DeliverySettings) -> Self {
        Self::with_store(Arc::new(InMemoryGateStore::new()), Arc::new(SystemClock), defaults)
    }

    pub fn with_store(
        store: Arc<dyn GateStateStore>,
        clock: Arc<dyn Clock>,
        defaults: DeliverySettings,
    ) -> Self {
        Self {
            store,
            clock,
            defaults,
            slots: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> &DeliverySettings {
        &self.defaults
    }

    pub fn retry_policy(&self, endpoint: &Endpoint) -> RetryPolicy {
        endpoint
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.defaults.retry.clone())
    }

    pub fn breaker_policy(&self, endpoint: &Endpoint) -> BreakerPolicy {
        endpoint
            .breaker_policy
            .clone()
            .unwrap_or_else(|| self.defaults.breaker.clone())
    }

    pub fn rate_limit_policy(&self, endpoint: &Endpoint) -> Option<RateLimitPolicy> {
        endpoint
            .rate_limit
            .clone()
            .or_else(|| self.defaults.rate_limit.clone())
    }

    /// Ask whether an attempt may start now
    pub async fn admit(&self, endpoint: &Endpoint) -> Result<Admission> {
        let key = endpoint.gate_key();
        let breaker = self.breaker_policy(endpoint);
        let limit = self.rate_limit_policy(endpoint);
        let overflow = self.defaults.overflow;
        let now = self.clock.now_ms();
        let mut admission = Admission::Proceed;

        self.store
            .update(&key, &mut |state: &mut EndpointState| {
                let was_open = state.breaker.status == BreakerStatus::Open;
                if let Err(remaining) = state.breaker.admit(&breaker, now) {
                    state.stats.circuit_open_rejections += 1;
                    admission = Admission::Rejected(Rejection::CircuitOpen {
                        retry_after: Duration::from_millis(remaining),
                    });
                    return;
                }
                if was_open {
                    info!(endpoint = %key, "Circuit half-open, probing");
                }

                let Some(policy) = &limit else {
                    admission = Admission::Proceed;
                    return;
                };
                let reusable = state
                    .limiter
                    .as_ref()
                    .map_or(false, |limiter| limiter.matches(policy.strategy));
                if !reusable {
                    state.limiter = Some(LimiterState::fresh(policy, now));
                }
                let acquired = match state.limiter.as_mut() {
                    Some(limiter) => limiter.try_acquire(policy, now),
                    None => Ok(()),
                };
                admission = match acquired {
                    Ok(()) => Admission::Proceed,
                    Err(wait_ms) => {
                        state.stats.rate_limited += 1;
                        let retry_after = Duration::from_millis(wait_ms);
                        match overflow {
                            OverflowPolicy::Queue => Admission::Wait(retry_after),
                            OverflowPolicy::Reject => {
                                Admission::Rejected(Rejection::RateLimited { retry_after })
                            }
                        }
                    }
                };
            })
            .await?;

        debug!(endpoint = %endpoint.gate_key(), admission = ?admission, "Gate admission");
        Ok(admission)
    }

    /// Feed an attempt's outcome back into the breaker
    pub async fn record(&self, endpoint: &Endpoint, outcome: AttemptOutcome) -> Result<BreakerStatus> {
        let key = endpoint.gate_key();
        let policy = self.breaker_policy(endpoint);
        let now = self.clock.now_ms();
        let mut status = BreakerStatus::Closed;
        let mut opened = false;

        self.store
            .update(&key, &mut |state: &mut EndpointState| {
                match outcome {
                    AttemptOutcome::Success => {
                        state.stats.successes += 1;
                        state.breaker.record_success(&policy);
                    }
                    AttemptOutcome::Failure(class) if class.trips_breaker() => {
                        state.stats.transport_failures += 1;
                        opened = state.breaker.record_failure(&policy, now);
                    }
                    AttemptOutcome::Failure(_) => {
                        state.stats.business_rejections += 1;
                    }
                }
                status = state.breaker.status;
            })
            .await?;

        if opened {
            warn!(endpoint = %key, open_ms = policy.open_ms, "Circuit opened");
        }
        Ok(status)
    }

    /// Whether failed attempt number `attempt` (1-based) should be retried
    pub fn retry_decision(
        &self,
        endpoint: &Endpoint,
        attempt: u32,
        classification: ErrorClassification,
    ) -> RetryDecision {
        if !classification.is_retryable() {
            return RetryDecision::GiveUp;
        }
        let policy = self.retry_policy(endpoint);
        if attempt >= policy.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: policy.next_delay(attempt),
        }
    }

    /// Hold one of the endpoint's concurrency slots
    pub async fn acquire_slot(&self, endpoint: &Endpoint) -> Result<OwnedSemaphorePermit> {
        let permits = endpoint
            .max_concurrent_per_endpoint
            .unwrap_or(self.defaults.max_concurrent_per_endpoint)
            .max(1);
        let semaphore = self
            .slots
            .entry(endpoint.gate_key())
            .or_insert_with(|| Arc::new(Semaphore::new(permits)))
            .value()
            .clone();
        semaphore
            .acquire_owned()
            .await
            .map_err(|err| RouterError::Internal(format!("concurrency slots closed: {}", err)))
    }

    pub async fn state(&self, endpoint: &Endpoint) -> Result<Option<EndpointState>> {
        self.store.snapshot(&endpoint.gate_key()).await
    }
}
