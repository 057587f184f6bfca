// Wave dispatcher
// Executes a dispatch plan: waves in order, units of a wave concurrently

//! # Dispatcher
//!
//! Runs a [`DispatchPlan`] against the connectors:
//!
//! - waves run one after another, with a barrier between them
//! - units of a wave run concurrently (`futures::future::join_all`)
//! - a unit runs only if every dependency delivered; otherwise it is skipped
//!   with `dependency_unmet`
//! - each attempt passes the [`DeliveryGate`]; transient failures are retried
//!   after the policy delay
//!
//! Failures stay scoped to their unit. One failed destination never stops a
//! sibling in the same wave.
//!
//! ## Cancellation
//!
//! A [`CancellationToken`] is checked before every attempt and raced against
//! every wait (rate-limit queueing, retry back-off, concurrency slots). An
//! attempt that already reached the connector is allowed to finish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::catalog::RuleCatalog;
use crate::engine::connector::{Connector, IdentityTransformer, PayloadTransformer};
use crate::engine::gate::{Admission, DeliveryGate, RetryDecision};
use crate::engine::outbound::{DispatchPlan, DispatchUnit, SkipReason};
use crate::engine::tracking::TrackingRecorder;
use crate::models::{
    AttemptOutcome, ConnectorResponse, DeliveryError, Endpoint, ErrorClassification, ErrorType, RoutingKey,
    TrackingSeed, TrackingService, TrackingStatus, TrackingStep, TrackingStepName,
};
use crate::RouterError;

/// Final result of one dispatch unit
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Delivered {
        target: String,
        attempts: u32,
        status: u16,
    },
    Failed {
        target: String,
        attempts: u32,
        error_type: ErrorType,
        classification: Option<ErrorClassification>,
        reason: String,
    },
    Skipped {
        target: String,
        reason: SkipReason,
    },
    Cancelled {
        target: String,
        attempts: u32,
    },
}

impl UnitOutcome {
    pub fn target(&self) -> &str {
        match self {
            UnitOutcome::Delivered { target, .. }
            | UnitOutcome::Failed { target, .. }
            | UnitOutcome::Skipped { target, .. }
            | UnitOutcome::Cancelled { target, .. } => target,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, UnitOutcome::Delivered { .. })
    }

    /// Failed or cancelled
    pub fn is_failure(&self) -> bool {
        matches!(self, UnitOutcome::Failed { .. } | UnitOutcome::Cancelled { .. })
    }

    fn failed(target: &str, attempts: u32, error: &RouterError) -> Self {
        let classification = match error {
            RouterError::Delivery(err) => Some(err.classification),
            _ => None,
        };
        UnitOutcome::Failed {
            target: target.to_string(),
            attempts,
            error_type: error.error_type(),
            classification,
            reason: error.to_string(),
        }
    }
}

/// Outcomes of every unit of a plan, including the ones the planner skipped
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub outcomes: Vec<UnitOutcome>,
    pub cancelled: bool,
}

impl DispatchReport {
    pub fn delivered(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|o| o.is_delivered())
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    pub fn outcome(&self, target: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.target() == target)
    }
}

pub struct Dispatcher {
    catalog: Arc<dyn RuleCatalog>,
    gate: Arc<DeliveryGate>,
    connector: Arc<dyn Connector>,
    transformer: Arc<dyn PayloadTransformer>,
    tracking: Option<Arc<TrackingRecorder>>,
}

impl Dispatcher {
    pub fn new(catalog: Arc<dyn RuleCatalog>, gate: Arc<DeliveryGate>, connector: Arc<dyn Connector>) -> Self {
        Self {
            catalog,
            gate,
            connector,
            transformer: Arc::new(IdentityTransformer),
            tracking: None,
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn PayloadTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Record per-target progress steps
    pub fn with_tracking(mut self, tracking: Arc<TrackingRecorder>) -> Self {
        self.tracking = Some(tracking);
        self
    }

    pub fn gate(&self) -> &DeliveryGate {
        &self.gate
    }

    /// Execute every wave of `plan`
    pub async fn dispatch(
        &self,
        correlation_id: &str,
        plan: &DispatchPlan,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        report.outcomes.extend(plan.skipped.iter().map(|skipped| UnitOutcome::Skipped {
            target: skipped.rule.target.clone(),
            reason: skipped.reason.clone(),
        }));

        let mut delivered: HashMap<String, bool> = HashMap::new();

        for (index, wave) in plan.waves.iter().enumerate() {
            debug!(correlation_id, wave = index, units = wave.len(), "Dispatching wave");
            let runs = wave.iter().map(|unit| {
                let delivered = &delivered;
                async move {
                    let missing: Vec<String> = unit
                        .dependencies()
                        .filter(|dep| !delivered.get(*dep).copied().unwrap_or(false))
                        .map(str::to_string)
                        .collect();
                    if !missing.is_empty() {
                        debug!(destination = unit.target(), missing = ?missing, "Dependency did not deliver");
                        return UnitOutcome::Skipped {
                            target: unit.target().to_string(),
                            reason: SkipReason::DependencyUnmet { missing },
                        };
                    }
                    self.run_unit(correlation_id, &plan.key, unit, payload, cancel).await
                }
            });
            let outcomes = join_all(runs).await;

            for outcome in outcomes {
                delivered.insert(outcome.target().to_string(), outcome.is_delivered());
                report.outcomes.push(outcome);
            }
        }

        report.cancelled = cancel.is_cancelled();
        info!(
            correlation_id,
            key = %plan.key,
            delivered = report.delivered().count(),
            failed = report.failures().count(),
            cancelled = report.cancelled,
            "Dispatch finished"
        );
        report
    }

    async fn run_unit(
        &self,
        correlation_id: &str,
        key: &RoutingKey,
        unit: &DispatchUnit,
        payload: &Value,
        cancel: &CancellationToken,
    ) -> UnitOutcome {
        let target = unit.target();

        let endpoint = match self.catalog.find_endpoint(target, &key.entity, &key.action).await {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                let error = RouterError::Delivery(DeliveryError::fatal(format!(
                    "no active endpoint for {}/{}/{}",
                    target, key.entity, key.action
                )));
                return self.give_up(correlation_id, target, 0, error).await;
            }
            Err(error) => return self.give_up(correlation_id, target, 0, error).await,
        };

        let body = match unit.rule.transformation.as_deref().map(str::trim) {
            Some(expression) if !expression.is_empty() => {
                match self.transformer.transform(expression, payload).await {
                    Ok(body) => body,
                    Err(error) => return self.give_up(correlation_id, target, 0, error).await,
                }
            }
            _ => payload.clone(),
        };

        self.track(correlation_id, target, TrackingStepName::OutboundSending, TrackingStatus::Pending, None)
            .await;

        let mut attempts = 0u32;
        let mut queued = Duration::ZERO;
        let max_queue_wait = self.gate.defaults().max_queue_wait();

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(correlation_id, target, attempts).await;
            }

            match self.gate.admit(&endpoint).await {
                Ok(Admission::Proceed) => {}
                Ok(Admission::Wait(delay)) => {
                    if queued + delay > max_queue_wait {
                        let error = RouterError::RateLimited(format!(
                            "{} stayed over its rate limit for more than {}ms",
                            endpoint.gate_key(),
                            max_queue_wait.as_millis()
                        ));
                        return self.give_up(correlation_id, target, attempts, error).await;
                    }
                    queued += delay;
                    if !sleep_or_cancel(delay, cancel).await {
                        return self.cancelled(correlation_id, target, attempts).await;
                    }
                    continue;
                }
                Ok(Admission::Rejected(rejection)) => {
                    let error = rejection.into_error(&endpoint);
                    return self.give_up(correlation_id, target, attempts, error).await;
                }
                Err(error) => return self.give_up(correlation_id, target, attempts, error).await,
            }

            // The slot covers a single attempt and is free again during back-off.
            let slot = tokio::select! {
                slot = self.gate.acquire_slot(&endpoint) => match slot {
                    Ok(slot) => slot,
                    Err(error) => return self.give_up(correlation_id, target, attempts, error).await,
                },
                _ = cancel.cancelled() => return self.cancelled(correlation_id, target, attempts).await,
            };
            attempts += 1;
            let result = self.attempt(&endpoint, &body).await;
            drop(slot);
            let outcome = AttemptOutcome::from_result(&result);
            if let Err(error) = self.gate.record(&endpoint, outcome).await {
                warn!(destination = target, error = %error, "Could not record attempt outcome");
            }

            let error = match (outcome, result) {
                (AttemptOutcome::Success, Ok(response)) => {
                    debug!(correlation_id, destination = target, attempts, status = response.status, "Delivered");
                    self.track(correlation_id, target, TrackingStepName::OutboundResponse, TrackingStatus::Success, None)
                        .await;
                    return UnitOutcome::Delivered {
                        target: target.to_string(),
                        attempts,
                        status: response.status,
                    };
                }
                (_, Ok(response)) => DeliveryError::from_status(response.status, &response.body),
                (_, Err(error)) => error,
            };

            match self
                .gate
                .retry_decision(&endpoint, attempts, error.effective_classification())
            {
                RetryDecision::Retry { delay } => {
                    debug!(
                        correlation_id,
                        destination = target,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying delivery"
                    );
                    self.track(
                        correlation_id,
                        target,
                        TrackingStepName::OutboundSending,
                        TrackingStatus::Retrying,
                        Some(error.message.clone()),
                    )
                    .await;
                    if !sleep_or_cancel(delay, cancel).await {
                        return self.cancelled(correlation_id, target, attempts).await;
                    }
                }
                RetryDecision::GiveUp => {
                    return self
                        .give_up(correlation_id, target, attempts, RouterError::Delivery(error))
                        .await;
                }
            }
        }
    }

    async fn attempt(&self, endpoint: &Endpoint, body: &Value) -> Result<ConnectorResponse, DeliveryError> {
        match endpoint.timeout() {
            Some(limit) => match tokio::time::timeout(limit, self.connector.dispatch(endpoint, body)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::transient(format!(
                    "no answer within {}ms",
                    limit.as_millis()
                ))),
            },
            None => self.connector.dispatch(endpoint, body).await,
        }
    }

    async fn give_up(&self, correlation_id: &str, target: &str, attempts: u32, error: RouterError) -> UnitOutcome {
        warn!(correlation_id, destination = target, attempts, error = %error, "Delivery failed");
        self.track(
            correlation_id,
            target,
            TrackingStepName::OutboundResponse,
            TrackingStatus::Failed,
            Some(error.to_string()),
        )
        .await;
        UnitOutcome::failed(target, attempts, &error)
    }

    async fn cancelled(&self, correlation_id: &str, target: &str, attempts: u32) -> UnitOutcome {
        info!(correlation_id, destination = target, attempts, "Delivery cancelled");
        self.track(
            correlation_id,
            target,
            TrackingStepName::OutboundResponse,
            TrackingStatus::Failed,
            Some("cancelled".to_string()),
        )
        .await;
        UnitOutcome::Cancelled {
            target: target.to_string(),
            attempts,
        }
    }

    async fn track(
        &self,
        correlation_id: &str,
        target: &str,
        step: TrackingStepName,
        status: TrackingStatus,
        reason: Option<String>,
    ) {
        let Some(tracking) = &self.tracking else {
            return;
        };
        let mut entry = TrackingStep::new(step, TrackingService::Connectors, status).for_agent(target);
        if let Some(reason) = reason {
            entry = entry.with_reason(reason);
        }
        if status.is_terminal() {
            entry = entry.finished_at(chrono::Utc::now());
        }
        if let Err(error) = tracking
            .record_step(correlation_id, &TrackingSeed::default(), entry)
            .await
        {
            warn!(correlation_id, destination = target, error = %error, "Could not record tracking step");
        }
    }
}

/// Sleep unless cancelled first; returns false on cancellation
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliverySettings, OverflowPolicy};
    use crate::engine::catalog::InMemoryCatalog;
    use crate::engine::outbound::build_plan;
    use crate::engine::testing::{endpoint, status, RejectingTransformer, ScriptedConnector};
    use crate::engine::tracking::InMemoryTrackingStore;
    use crate::models::{OutboundRule, RateLimitPolicy, RateLimitStrategy};
    use serde_json::json;
    use std::time::Instant;

    fn key() -> RoutingKey {
        RoutingKey::new("erp", "driver", "create")
    }

    fn rule(target: &str) -> OutboundRule {
        OutboundRule::new("erp", "driver", "create", target)
    }

    async fn setup(
        targets: &[&str],
        connector: ScriptedConnector,
        settings: DeliverySettings,
    ) -> (Dispatcher, Arc<ScriptedConnector>) {
        let catalog = Arc::new(InMemoryCatalog::new());
        for target in targets {
            catalog.publish_endpoint(endpoint(target, "driver")).await.unwrap();
        }
        let connector = Arc::new(connector);
        let dispatcher = Dispatcher::new(catalog, Arc::new(DeliveryGate::new(settings)), connector.clone());
        (dispatcher, connector)
    }

    #[tokio::test]
    async fn test_single_wave_delivers_all() {
        let (dispatcher, connector) =
            setup(&["wms", "crm"], ScriptedConnector::new(), DeliverySettings::default()).await;
        let plan = build_plan(&key(), vec![rule("wms"), rule("crm")], &json!({})).unwrap();

        let report = dispatcher
            .dispatch("c-1", &plan, &json!({"id": 1}), &CancellationToken::new())
            .await;
        assert_eq!(report.delivered().count(), 2);
        assert_eq!(connector.payloads_for("wms"), vec![json!({"id": 1})]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let connector = ScriptedConnector::new().script(
            "wms",
            vec![status(503), Err(DeliveryError::transient("connection reset")), status(201)],
        );
        let (dispatcher, connector) = setup(&["wms"], connector, DeliverySettings::default()).await;
        let plan = build_plan(&key(), vec![rule("wms")], &json!({})).unwrap();

        let report = dispatcher.dispatch("c-2", &plan, &json!({}), &CancellationToken::new()).await;
        assert_eq!(
            report.outcome("wms"),
            Some(&UnitOutcome::Delivered {
                target: "wms".into(),
                attempts: 3,
                status: 201
            })
        );
        assert_eq!(connector.call_count("wms"), 3);
    }

    #[tokio::test]
    async fn test_business_failure_skips_dependents_not_siblings() {
        let connector = ScriptedConnector::new().script("wms", vec![status(422)]);
        let (dispatcher, connector) =
            setup(&["wms", "crm", "billing"], connector, DeliverySettings::default()).await;
        let plan = build_plan(
            &key(),
            vec![rule("wms"), rule("crm"), rule("billing").depends_on("wms")],
            &json!({}),
        )
        .unwrap();

        let report = dispatcher.dispatch("c-3", &plan, &json!({}), &CancellationToken::new()).await;

        match report.outcome("wms") {
            Some(UnitOutcome::Failed {
                attempts,
                classification,
                error_type,
                ..
            }) => {
                assert_eq!(*attempts, 1);
                assert_eq!(*classification, Some(ErrorClassification::Business));
                assert_eq!(*error_type, ErrorType::Business);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(report.outcome("crm").unwrap().is_delivered());
        assert!(matches!(
            report.outcome("billing"),
            Some(UnitOutcome::Skipped {
                reason: SkipReason::DependencyUnmet { .. },
                ..
            })
        ));
        assert_eq!(connector.call_count("billing"), 0);
    }

    #[tokio::test]
    async fn test_waves_run_in_order() {
        let (dispatcher, connector) =
            setup(&["wms", "crm", "billing"], ScriptedConnector::new(), DeliverySettings::default()).await;
        let plan = build_plan(
            &key(),
            vec![rule("billing").depends_on("crm"), rule("crm").depends_on("wms"), rule("wms")],
            &json!({}),
        )
        .unwrap();

        dispatcher.dispatch("c-4", &plan, &json!({}), &CancellationToken::new()).await;
        assert_eq!(connector.calls(), vec!["wms", "crm", "billing"]);
    }

    fn recorder() -> Arc<TrackingRecorder> {
        Arc::new(TrackingRecorder::new(Arc::new(InMemoryTrackingStore::new())))
    }

    #[tokio::test]
    async fn test_missing_endpoint_fails_unit() {
        let (dispatcher, _) = setup(&[], ScriptedConnector::new(), DeliverySettings::default()).await;
        let tracking = recorder();
        let dispatcher = dispatcher.with_tracking(tracking.clone());
        let plan = build_plan(&key(), vec![rule("ghost")], &json!({})).unwrap();

        let report = dispatcher.dispatch("c-5", &plan, &json!({}), &CancellationToken::new()).await;
        assert!(matches!(
            report.outcome("ghost"),
            Some(UnitOutcome::Failed {
                classification: Some(ErrorClassification::Fatal),
                error_type: ErrorType::ApplicationFatal,
                attempts: 0,
                ..
            })
        ));
        let record = tracking.get("c-5").await.unwrap().unwrap();
        let step = record.steps.last().unwrap();
        assert_eq!(step.step, TrackingStepName::OutboundResponse);
        assert_eq!(step.status, TrackingStatus::Failed);
    }

    #[tokio::test]
    async fn test_transformation_failure_is_tracked() {
        let (dispatcher, connector) =
            setup(&["wms", "crm"], ScriptedConnector::new(), DeliverySettings::default()).await;
        let tracking = recorder();
        let dispatcher = dispatcher
            .with_transformer(Arc::new(RejectingTransformer))
            .with_tracking(tracking.clone());
        let mut mapped = rule("wms");
        mapped.transformation = Some("driver_to_wms".to_string());
        let plan = build_plan(&key(), vec![mapped, rule("crm")], &json!({})).unwrap();

        let report = dispatcher.dispatch("c-11", &plan, &json!({}), &CancellationToken::new()).await;

        assert!(matches!(report.outcome("wms"), Some(UnitOutcome::Failed { attempts: 0, .. })));
        assert!(report.outcome("crm").unwrap().is_delivered());
        assert_eq!(connector.call_count("wms"), 0);

        let record = tracking.get("c-11").await.unwrap().unwrap();
        let failed: Vec<&TrackingStep> = record
            .steps
            .iter()
            .filter(|s| s.agent.as_deref() == Some("wms"))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, TrackingStatus::Failed);
        assert!(failed[0]
            .status_reason
            .as_deref()
            .unwrap_or_default()
            .contains("driver_to_wms"));
    }

    #[tokio::test]
    async fn test_unclassified_connector_error_is_retried() {
        let unclassified = DeliveryError {
            classification: ErrorClassification::None,
            message: "stream ended early".to_string(),
            status: None,
        };
        let connector = ScriptedConnector::new().script("wms", vec![Err(unclassified), status(200)]);
        let (dispatcher, connector) = setup(&["wms"], connector, DeliverySettings::default()).await;
        let plan = build_plan(&key(), vec![rule("wms")], &json!({})).unwrap();

        let report = dispatcher.dispatch("c-12", &plan, &json!({}), &CancellationToken::new()).await;
        assert!(matches!(report.outcome("wms"), Some(UnitOutcome::Delivered { attempts: 2, .. })));
        assert_eq!(connector.call_count("wms"), 2);
    }

    #[tokio::test]
    async fn test_concurrency_slot_is_free_during_backoff() {
        let catalog = Arc::new(InMemoryCatalog::new());
        let mut single = endpoint("wms", "driver");
        single.max_concurrent_per_endpoint = Some(1);
        if let Some(retry) = single.retry_policy.as_mut() {
            retry.delay_ms = 300;
        }
        catalog.publish_endpoint(single.clone()).await.unwrap();
        let connector = ScriptedConnector::new().script("wms", vec![status(503), status(200)]);
        let dispatcher = Dispatcher::new(
            catalog,
            Arc::new(DeliveryGate::new(DeliverySettings::default())),
            Arc::new(connector),
        );
        let plan = build_plan(&key(), vec![rule("wms")], &json!({})).unwrap();

        let other_sender = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::time::timeout(Duration::from_millis(100), dispatcher.gate().acquire_slot(&single))
                .await
                .is_ok()
        };
        let payload = json!({});
        let cancel = CancellationToken::new();
        let (report, slot_was_free) = tokio::join!(
            dispatcher.dispatch("c-13", &plan, &payload, &cancel),
            other_sender
        );

        assert!(slot_was_free);
        assert!(matches!(report.outcome("wms"), Some(UnitOutcome::Delivered { attempts: 2, .. })));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (dispatcher, connector) =
            setup(&["wms"], ScriptedConnector::new(), DeliverySettings::default()).await;
        let plan = build_plan(&key(), vec![rule("wms")], &json!({})).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = dispatcher.dispatch("c-6", &plan, &json!({}), &cancel).await;
        assert!(report.cancelled);
        assert!(matches!(report.outcome("wms"), Some(UnitOutcome::Cancelled { attempts: 0, .. })));
        assert_eq!(connector.call_count("wms"), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_backoff() {
        let connector = ScriptedConnector::new().script("wms", vec![status(500)]);
        let catalog = Arc::new(InMemoryCatalog::new());
        let mut slow = endpoint("wms", "driver");
        if let Some(retry) = slow.retry_policy.as_mut() {
            retry.delay_ms = 60_000;
        }
        catalog.publish_endpoint(slow).await.unwrap();
        let dispatcher = Dispatcher::new(
            catalog,
            Arc::new(DeliveryGate::new(DeliverySettings::default())),
            Arc::new(connector),
        );
        let plan = build_plan(&key(), vec![rule("wms")], &json!({})).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let report = dispatcher.dispatch("c-7", &plan, &json!({}), &cancel).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(report.outcome("wms"), Some(UnitOutcome::Cancelled { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn test_rate_limit_rejection_is_reported() {
        let settings = DeliverySettings {
            overflow: OverflowPolicy::Reject,
            rate_limit: Some(RateLimitPolicy {
                strategy: RateLimitStrategy::FixedWindow,
                limit: 1,
                interval_ms: 60_000,
                burst: None,
            }),
            ..DeliverySettings::default()
        };
        let (dispatcher, connector) = setup(&["wms"], ScriptedConnector::new(), settings).await;
        let plan = build_plan(&key(), vec![rule("wms")], &json!({})).unwrap();

        let first = dispatcher.dispatch("c-8", &plan, &json!({}), &CancellationToken::new()).await;
        assert!(first.outcome("wms").unwrap().is_delivered());

        let second = dispatcher.dispatch("c-9", &plan, &json!({}), &CancellationToken::new()).await;
        match second.outcome("wms") {
            Some(UnitOutcome::Failed { reason, attempts, .. }) => {
                assert!(reason.starts_with("Rate limited"));
                assert_eq!(*attempts, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(connector.call_count("wms"), 1);
    }

    #[tokio::test]
    async fn test_fan_out_steps_are_tracked() {
        let connector = ScriptedConnector::new().script("wms", vec![status(503), status(200)]);
        let (dispatcher, _) = setup(&["wms"], connector, DeliverySettings::default()).await;
        let tracking = recorder();
        let dispatcher = dispatcher.with_tracking(tracking.clone());
        let plan = build_plan(&key(), vec![rule("wms")], &json!({})).unwrap();

        dispatcher.dispatch("c-10", &plan, &json!({}), &CancellationToken::new()).await;

        let record = tracking.get("c-10").await.unwrap().unwrap();
        let statuses: Vec<TrackingStatus> = record.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![TrackingStatus::Pending, TrackingStatus::Retrying, TrackingStatus::Success]
        );
        assert!(record.steps.iter().all(|s| s.agent.as_deref() == Some("wms")));
        assert!(!record.status.is_terminal());
    }
}
