// Integration router
// Wires resolution, planning, dispatch, tracking and webhooks into one call

//! # Integration Router
//!
//! [`IntegrationRouter::handle`] takes one inbound event from receipt to a
//! terminal tracking status:
//!
//! ```text
//! event ─▶ InboundResolver::select ─▶ inbound transformation
//!       ─▶ InboundResolver::apply_routing ─▶ OutboundPlanner::plan
//!       ─▶ Dispatcher::dispatch ─▶ terminal tracking step ─▶ webhooks
//! ```
//!
//! Every stage writes a [`TrackingStep`]. The terminal step is written before
//! `handle` returns, so a caller that reads the tracking record afterwards
//! always sees the final status.
//!
//! ## Outcome Aggregation
//!
//! | Situation | Status |
//! |---|---|
//! | no inbound rule owns the event | `discarded` |
//! | resolution or planning error | `failed` |
//! | no destination survives planning | `discarded` |
//! | any unit failed or was cancelled | `failed` |
//! | at least one unit delivered, none failed | `success` |
//! | every unit skipped | `discarded` |
//!
//! ## Rust Learning Notes:
//!
//! ### Builder Pattern
//! The router has two required collaborators (catalog, connector) and several
//! optional ones. `IntegrationRouter::builder(..)` takes the required ones and
//! each optional one gets a chained setter, so call sites only mention what
//! they change.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::engine::catalog::{CachedCatalog, RuleCatalog};
use crate::engine::connector::{Connector, IdentityTransformer, PayloadTransformer, WebhookNotifier};
use crate::engine::dispatcher::{DispatchReport, Dispatcher, UnitOutcome};
use crate::engine::gate::DeliveryGate;
use crate::engine::inbound::InboundResolver;
use crate::engine::outbound::OutboundPlanner;
use crate::engine::tracking::{InMemoryTrackingStore, TrackingRecorder, TrackingStore};
use crate::models::{
    resolve_path, ErrorType, RoutingKey, RoutingMode, TrackingRecord, TrackingSeed,
    TrackingService, TrackingStatus, TrackingStep, TrackingStepName, WebhookPayload,
    WebhookSubscription,
};
use crate::{Result, RouterError};

/// What happened to one event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingOutcome {
    pub correlation_id: String,
    /// Terminal status written to tracking
    pub status: TrackingStatus,
    /// Effective key once resolved, the observed key otherwise
    pub key: RoutingKey,
    pub mode: Option<RoutingMode>,
    pub reason: Option<String>,
    pub error_type: Option<ErrorType>,
    pub report: Option<DispatchReport>,
    /// Subscriptions that accepted the terminal notification
    pub webhooks_notified: usize,
}

impl RoutingOutcome {
    pub fn is_success(&self) -> bool {
        self.status == TrackingStatus::Success
    }
}

/// Per-event state threaded through the stages
struct Context {
    correlation_id: String,
    observed: RoutingKey,
    key: RoutingKey,
    mode: Option<RoutingMode>,
    business_key: Option<Value>,
    cancel: CancellationToken,
}

impl Context {
    fn seed(&self) -> TrackingSeed {
        let mut seed = TrackingSeed::new(&self.key.agent, &self.key.entity, &self.key.action);
        if let Some(business_key) = &self.business_key {
            seed = seed.with_business_key(business_key.clone());
        }
        if let Some(mode) = self.mode {
            seed = seed.with_routing_mode(mode);
        }
        seed
    }
}

pub struct IntegrationRouter {
    catalog: Arc<dyn RuleCatalog>,
    /// Set when lookups go through the TTL cache
    cache: Option<Arc<CachedCatalog>>,
    resolver: InboundResolver,
    planner: OutboundPlanner,
    dispatcher: Dispatcher,
    transformer: Arc<dyn PayloadTransformer>,
    notifier: Option<Arc<dyn WebhookNotifier>>,
    tracking: Arc<TrackingRecorder>,
}

pub struct IntegrationRouterBuilder {
    catalog: Arc<dyn RuleCatalog>,
    connector: Arc<dyn Connector>,
    transformer: Arc<dyn PayloadTransformer>,
    notifier: Option<Arc<dyn WebhookNotifier>>,
    tracking_store: Option<Arc<dyn TrackingStore>>,
    gate: Option<Arc<DeliveryGate>>,
    settings: Settings,
}

impl IntegrationRouterBuilder {
    pub fn transformer(mut self, transformer: Arc<dyn PayloadTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn WebhookNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn tracking_store(mut self, store: Arc<dyn TrackingStore>) -> Self {
        self.tracking_store = Some(store);
        self
    }

    /// Share a gate (and its breaker state) between routers
    pub fn gate(mut self, gate: Arc<DeliveryGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> IntegrationRouter {
        let cache = self
            .settings
            .catalog
            .cache_ttl()
            .map(|ttl| Arc::new(CachedCatalog::new(self.catalog.clone(), ttl)));
        let catalog: Arc<dyn RuleCatalog> = match &cache {
            Some(cache) => cache.clone(),
            None => self.catalog,
        };
        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(DeliveryGate::new(self.settings.delivery.clone())));
        let store = self
            .tracking_store
            .unwrap_or_else(|| Arc::new(InMemoryTrackingStore::new()));
        let tracking = Arc::new(
            TrackingRecorder::new(store).with_service_name(self.settings.tracking.service_name.clone()),
        );

        let dispatcher = Dispatcher::new(catalog.clone(), gate, self.connector)
            .with_transformer(self.transformer.clone())
            .with_tracking(tracking.clone());

        IntegrationRouter {
            resolver: InboundResolver::new(catalog.clone()),
            planner: OutboundPlanner::new(catalog.clone()),
            catalog,
            cache,
            dispatcher,
            transformer: self.transformer,
            notifier: self.notifier,
            tracking,
        }
    }
}

impl IntegrationRouter {
    pub fn builder(catalog: Arc<dyn RuleCatalog>, connector: Arc<dyn Connector>) -> IntegrationRouterBuilder {
        IntegrationRouterBuilder {
            catalog,
            connector,
            transformer: Arc::new(IdentityTransformer),
            notifier: None,
            tracking_store: None,
            gate: None,
            settings: Settings::default(),
        }
    }

    /// Tracking read API
    pub fn tracking(&self) -> &TrackingRecorder {
        &self.tracking
    }

    pub fn gate(&self) -> &DeliveryGate {
        self.dispatcher.gate()
    }

    /// Drop cached catalog lookups
    ///
    /// Call after publishing or activating rules so the next event sees them
    /// without waiting for the cache TTL. A no-op when caching is disabled.
    pub fn invalidate_catalog(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate();
        }
    }

    /// Route an event under a freshly generated correlation id
    pub async fn handle_event(&self, key: RoutingKey, payload: Value) -> Result<RoutingOutcome> {
        let correlation_id = Uuid::new_v4().to_string();
        self.handle(&correlation_id, key, payload).await
    }

    pub async fn handle(&self, correlation_id: &str, key: RoutingKey, payload: Value) -> Result<RoutingOutcome> {
        self.handle_with_cancel(correlation_id, key, payload, &CancellationToken::new())
            .await
    }

    /// Route one event; `cancel` aborts pending waits and later attempts
    ///
    /// `Err` is reserved for tracking failures and invalid input. Every
    /// routing failure is reported as a `failed` outcome instead.
    pub async fn handle_with_cancel(
        &self,
        correlation_id: &str,
        key: RoutingKey,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<RoutingOutcome> {
        if correlation_id.trim().is_empty() {
            return Err(RouterError::InvalidInput("correlation id is required".to_string()));
        }
        let mut ctx = Context {
            correlation_id: correlation_id.to_string(),
            observed: key.clone(),
            key,
            mode: None,
            business_key: None,
            cancel: cancel.clone(),
        };
        info!(correlation_id, key = %ctx.observed, "Event received");

        self.step(&ctx, TrackingStepName::EsbProcessing, TrackingStatus::Pending, None)
            .await?;

        let selection = match self.resolver.select(&ctx.observed).await {
            Ok(Some(selection)) => selection,
            Ok(None) => {
                let reason = format!("no active inbound rule for {}", ctx.observed);
                return self
                    .finish(&ctx, TrackingStepName::EsbRouted, TrackingStatus::Discarded, Some(reason), None, None)
                    .await;
            }
            Err(error) => return self.fail(&ctx, TrackingStepName::EsbRouted, error).await,
        };

        let canonical = match selection.rule.transformation.as_deref().map(str::trim) {
            Some(expression) if !expression.is_empty() => {
                match self.transformer.transform(expression, &payload).await {
                    Ok(canonical) => canonical,
                    Err(error) => return self.fail(&ctx, TrackingStepName::EsbRouted, error).await,
                }
            }
            _ => payload,
        };

        let route = match self.resolver.apply_routing(&selection, &canonical).await {
            Ok(route) => route,
            Err(error) => return self.fail(&ctx, TrackingStepName::EsbRouted, error).await,
        };
        ctx.key = route.key;
        ctx.mode = Some(route.mode);
        ctx.business_key = route
            .rule
            .external_reference_extraction
            .as_deref()
            .and_then(|paths| extract_business_key(paths, &canonical));

        self.step(&ctx, TrackingStepName::EsbRouted, TrackingStatus::Pending, None)
            .await?;

        let plan = match self.planner.plan(&ctx.key, &canonical).await {
            Ok(plan) => plan,
            Err(error) => return self.fail(&ctx, TrackingStepName::OutboundSending, error).await,
        };
        if plan.is_empty() {
            let reason = if plan.skipped.is_empty() {
                format!("no outbound destination for {}", ctx.key)
            } else {
                let skipped: Vec<String> = plan
                    .skipped
                    .iter()
                    .map(|unit| format!("{} ({})", unit.rule.target, unit.reason))
                    .collect();
                format!("every destination skipped: {}", skipped.join("; "))
            };
            return self
                .finish(&ctx, TrackingStepName::OutboundResponse, TrackingStatus::Discarded, Some(reason), None, None)
                .await;
        }

        let report = self
            .dispatcher
            .dispatch(&ctx.correlation_id, &plan, &canonical, cancel)
            .await;
        let (status, reason, error_type) = aggregate(&report);
        self.finish(&ctx, TrackingStepName::OutboundResponse, status, reason, error_type, Some(report))
            .await
    }

    async fn step(
        &self,
        ctx: &Context,
        name: TrackingStepName,
        status: TrackingStatus,
        reason: Option<String>,
    ) -> Result<TrackingRecord> {
        let mut step = TrackingStep::new(name, TrackingService::Esb, status);
        if let Some(reason) = reason {
            step = step.with_reason(reason);
        }
        if status.is_terminal() {
            step = step.finished_at(chrono::Utc::now());
        }
        self.tracking
            .record_step(&ctx.correlation_id, &ctx.seed(), step)
            .await
    }

    async fn fail(
        &self,
        ctx: &Context,
        stage: TrackingStepName,
        error: RouterError,
    ) -> Result<RoutingOutcome> {
        warn!(correlation_id = %ctx.correlation_id, key = %ctx.key, error = %error, "Routing failed");
        let error_type = error.error_type();
        self.finish(ctx, stage, TrackingStatus::Failed, Some(error.to_string()), Some(error_type), None)
            .await
    }

    async fn finish(
        &self,
        ctx: &Context,
        stage: TrackingStepName,
        status: TrackingStatus,
        reason: Option<String>,
        error_type: Option<ErrorType>,
        report: Option<DispatchReport>,
    ) -> Result<RoutingOutcome> {
        let record = self.step(ctx, stage, status, reason.clone()).await?;
        info!(
            correlation_id = %ctx.correlation_id,
            key = %ctx.key,
            status = %record.status,
            reason = ?reason,
            "Event routed"
        );

        let webhooks_notified = self.notify_subscribers(ctx, &record).await?;

        Ok(RoutingOutcome {
            correlation_id: ctx.correlation_id.clone(),
            status,
            key: ctx.key.clone(),
            mode: ctx.mode,
            reason,
            error_type,
            report,
            webhooks_notified,
        })
    }

    /// Tell the source agent's subscribers about the terminal status
    async fn notify_subscribers(&self, ctx: &Context, record: &TrackingRecord) -> Result<usize> {
        let Some(notifier) = &self.notifier else {
            return Ok(0);
        };
        let subscriptions = match self.catalog.find_webhook_subscriptions(&ctx.observed.agent).await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                warn!(correlation_id = %ctx.correlation_id, error = %error, "Could not load webhook subscriptions");
                return Ok(0);
            }
        };
        let matching: Vec<&WebhookSubscription> = subscriptions
            .iter()
            .filter(|sub| sub.is_active && sub.matches_event(&record.entity, &record.action))
            .collect();
        if matching.is_empty() {
            return Ok(0);
        }

        let payload = WebhookPayload::from_record(record);
        let mut delivered = 0usize;
        let mut failures = Vec::new();
        for subscription in matching {
            match deliver_webhook(notifier.as_ref(), subscription, &payload, &ctx.cancel).await {
                Ok(()) => delivered += 1,
                Err(error) => failures.push(format!("{}: {}", subscription.target_url, error)),
            }
        }

        let (status, reason) = if failures.is_empty() {
            (TrackingStatus::Success, None)
        } else {
            (TrackingStatus::Failed, Some(failures.join("; ")))
        };
        let mut step = TrackingStep::new(TrackingStepName::WebhookDispatched, TrackingService::Webhook, status)
            .finished_at(chrono::Utc::now());
        if let Some(reason) = reason {
            step = step.with_reason(reason);
        }
        self.tracking
            .record_step(&ctx.correlation_id, &TrackingSeed::default(), step)
            .await?;
        if delivered > 0 {
            self.tracking.mark_webhook_delivered(&ctx.correlation_id).await?;
        }
        debug!(correlation_id = %ctx.correlation_id, delivered, failed = failures.len(), "Webhooks dispatched");
        Ok(delivered)
    }
}

/// Deliver with the subscription's retry policy
///
/// Cancellation stops before the next attempt and interrupts back-off.
async fn deliver_webhook(
    notifier: &dyn WebhookNotifier,
    subscription: &WebhookSubscription,
    payload: &WebhookPayload,
    cancel: &CancellationToken,
) -> Result<()> {
    let policy = subscription.effective_retry_policy();
    let cancelled = || RouterError::Cancelled("webhook delivery cancelled".to_string());
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        match notifier.notify(subscription, payload).await {
            Ok(()) => return Ok(()),
            Err(error) if attempt >= policy.max_retries => {
                warn!(url = %subscription.target_url, attempts = attempt + 1, error = %error, "Webhook delivery failed");
                return Err(error);
            }
            Err(error) => {
                let delay = policy
                    .backoff_ms
                    .get(attempt as usize)
                    .or_else(|| policy.backoff_ms.last())
                    .copied()
                    .unwrap_or(0);
                debug!(url = %subscription.target_url, attempt, delay_ms = delay, error = %error, "Retrying webhook");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    _ = cancel.cancelled() => {
                        info!(url = %subscription.target_url, attempts = attempt + 1, "Webhook delivery cancelled");
                        return Err(cancelled());
                    }
                }
                attempt += 1;
            }
        }
    }
}

/// Collapse unit outcomes into the event's terminal status
fn aggregate(report: &DispatchReport) -> (TrackingStatus, Option<String>, Option<ErrorType>) {
    if report.cancelled {
        return (
            TrackingStatus::Failed,
            Some("dispatch cancelled".to_string()),
            Some(ErrorType::Application),
        );
    }

    let failures: Vec<&UnitOutcome> = report.failures().collect();
    if !failures.is_empty() {
        let reason = failures
            .iter()
            .map(|outcome| match outcome {
                UnitOutcome::Failed { target, reason, .. } => format!("{}: {}", target, reason),
                other => format!("{}: cancelled", other.target()),
            })
            .collect::<Vec<_>>()
            .join("; ");
        let error_type = failures.iter().find_map(|outcome| match outcome {
            UnitOutcome::Failed { error_type, .. } => Some(*error_type),
            _ => None,
        });
        return (TrackingStatus::Failed, Some(reason), error_type);
    }

    if report.delivered().next().is_some() {
        (TrackingStatus::Success, None, None)
    } else {
        (
            TrackingStatus::Discarded,
            Some("every destination skipped".to_string()),
            None,
        )
    }
}

/// Business key from a comma-separated list of payload paths
///
/// Each path contributes one field named after its last segment. Paths that
/// do not resolve are left out; `None` when nothing resolves.
fn extract_business_key(paths: &str, payload: &Value) -> Option<Value> {
    let mut key = Map::new();
    for path in paths.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(value) = resolve_path(payload, path) {
            let name = path
                .rsplit(|c| c == '.' || c == '/')
                .next()
                .unwrap_or(path)
                .trim_end_matches(']');
            key.insert(name.to_string(), value.clone());
        }
    }
    (!key.is_empty()).then(|| Value::Object(key))
}
