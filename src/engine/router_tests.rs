// End-to-end routing scenarios through IntegrationRouter

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::engine::catalog::InMemoryCatalog;
use crate::engine::dispatcher::UnitOutcome;
use crate::engine::outbound::SkipReason;
use crate::engine::router::IntegrationRouter;
use crate::engine::testing::{endpoint, status, FlakyNotifier, RecordingNotifier, ScriptedConnector};
use crate::models::{
    ConditionNode, ErrorType, InboundRoute, InboundRule, IntegrationEntity, OnError, Operator,
    OutboundRule, RoutingKey, RoutingMode, TrackingCurrentStep, TrackingStatus, TrackingStepName,
    WebhookRetryPolicy, WebhookSubscription,
};
use crate::RouterError;

fn event() -> RoutingKey {
    RoutingKey::new("erp", "driver", "create")
}

/// erp/driver/create fans out to wms and crm; billing waits on wms
async fn catalog() -> Arc<InMemoryCatalog> {
    let catalog = Arc::new(InMemoryCatalog::new());
    catalog
        .publish_inbound(InboundRule::new("erp", "driver", "create,update", 1))
        .await
        .unwrap();
    for target in ["wms", "crm", "billing"] {
        catalog.publish_endpoint(endpoint(target, "driver")).await.unwrap();
    }
    catalog
        .publish_outbound(OutboundRule::new("erp", "driver", "create", "wms"))
        .await
        .unwrap();
    catalog
        .publish_outbound(OutboundRule::new("erp", "driver", "all", "crm"))
        .await
        .unwrap();
    catalog
        .publish_outbound(OutboundRule::new("erp", "driver", "create", "billing").depends_on("wms"))
        .await
        .unwrap();
    catalog
}

fn router(catalog: Arc<InMemoryCatalog>, connector: Arc<ScriptedConnector>) -> IntegrationRouter {
    IntegrationRouter::builder(catalog, connector).build()
}

#[tokio::test]
async fn test_event_delivered_to_every_destination() {
    let connector = Arc::new(ScriptedConnector::new());
    let router = router(catalog().await, connector.clone());

    let outcome = router
        .handle("corr-1", event(), json!({"name": "Ana"}))
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.mode, Some(RoutingMode::Direct));
    let report = outcome.report.unwrap();
    assert_eq!(report.delivered().count(), 3);
    let calls = connector.calls();
    assert_eq!(calls.last().map(String::as_str), Some("billing"));

    let record = router.tracking().get("corr-1").await.unwrap().unwrap();
    assert_eq!(record.status, TrackingStatus::Success);
    assert_eq!(record.current_step, TrackingCurrentStep::Completed);
    assert_eq!(record.entity, "driver");
    assert!(record.timestamp_end.is_some());
    assert!(record.duration_lifetime_ms.is_some());
    assert_eq!(record.steps[0].step, TrackingStepName::EsbProcessing);
    let last = record.steps.last().unwrap();
    assert_eq!(last.step, TrackingStepName::OutboundResponse);
    assert!(last.agent.is_none());
}

#[tokio::test]
async fn test_unrouted_event_is_discarded() {
    let connector = Arc::new(ScriptedConnector::new());
    let router = router(catalog().await, connector.clone());

    let outcome = router
        .handle("corr-2", RoutingKey::new("erp", "driver", "delete"), json!({}))
        .await
        .unwrap();

    assert_eq!(outcome.status, TrackingStatus::Discarded);
    assert!(outcome.report.is_none());
    assert!(connector.calls().is_empty());
    let record = router.tracking().get("corr-2").await.unwrap().unwrap();
    assert_eq!(record.current_step, TrackingCurrentStep::Discarded);
}

#[tokio::test]
async fn test_dependency_failure_fails_event_but_siblings_deliver() {
    let connector = Arc::new(ScriptedConnector::new().script("wms", vec![status(422)]));
    let router = router(catalog().await, connector.clone());

    let outcome = router.handle("corr-3", event(), json!({})).await.unwrap();

    assert_eq!(outcome.status, TrackingStatus::Failed);
    assert_eq!(outcome.error_type, Some(ErrorType::Business));
    let report = outcome.report.unwrap();
    assert!(report.outcome("crm").unwrap().is_delivered());
    assert!(matches!(
        report.outcome("billing"),
        Some(UnitOutcome::Skipped {
            reason: SkipReason::DependencyUnmet { .. },
            ..
        })
    ));
    assert_eq!(connector.call_count("billing"), 0);

    let record = router.tracking().get("corr-3").await.unwrap().unwrap();
    assert_eq!(record.status, TrackingStatus::Failed);
    assert!(record.status_reason.unwrap().contains("wms"));
}

#[tokio::test]
async fn test_payload_condition_reroutes_entity() {
    let catalog = catalog().await;
    let mut inbound = InboundRule::new("erp", "fleet", "create", 1);
    inbound.routing_entity = vec![
        InboundRoute::new(
            "driver",
            Some(ConditionNode::leaf("kind", Operator::Eq, json!("person"))),
        ),
        InboundRoute::fallback("vehicle"),
    ];
    catalog.publish_inbound(inbound).await.unwrap();
    catalog.publish_endpoint(endpoint("tms", "vehicle")).await.unwrap();
    catalog
        .publish_outbound(OutboundRule::new("erp", "vehicle", "create", "tms"))
        .await
        .unwrap();
    let connector = Arc::new(ScriptedConnector::new());
    let router = router(catalog, connector.clone());

    let outcome = router
        .handle("corr-4", RoutingKey::new("erp", "fleet", "create"), json!({"kind": "truck"}))
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.key, RoutingKey::new("erp", "vehicle", "create"));
    assert_eq!(connector.calls(), vec!["tms"]);

    let outcome = router
        .handle("corr-5", RoutingKey::new("erp", "fleet", "create"), json!({"kind": "person"}))
        .await
        .unwrap();
    assert_eq!(outcome.key.entity, "driver");
    let record = router.tracking().get("corr-5").await.unwrap().unwrap();
    assert_eq!(record.entity, "driver");
}

#[tokio::test]
async fn test_on_error_fail_stops_routing() {
    let catalog = catalog().await;
    let mut inbound = InboundRule::new("erp", "fleet", "create", 1);
    inbound.routing_entity = vec![InboundRoute::new(
        "driver",
        Some(ConditionNode::leaf("age", Operator::Gt, json!(18))),
    )
    .with_on_error(OnError::Fail)];
    catalog.publish_inbound(inbound).await.unwrap();
    let connector = Arc::new(ScriptedConnector::new());
    let router = router(catalog, connector.clone());

    let outcome = router
        .handle("corr-6", RoutingKey::new("erp", "fleet", "create"), json!({"age": "adult"}))
        .await
        .unwrap();

    assert_eq!(outcome.status, TrackingStatus::Failed);
    assert_eq!(outcome.error_type, Some(ErrorType::Application));
    assert!(connector.calls().is_empty());
}

#[tokio::test]
async fn test_entity_routing_mode_and_business_key_are_tracked() {
    let catalog = catalog().await;
    catalog
        .publish_entity(IntegrationEntity::new("driver", RoutingMode::Mdm))
        .await
        .unwrap();
    let mut inbound = InboundRule::new("erp", "driver", "create", 2);
    inbound.external_reference_extraction = Some("document.cpf".to_string());
    catalog.publish_inbound(inbound).await.unwrap();
    let router = router(catalog, Arc::new(ScriptedConnector::new()));

    let outcome = router
        .handle("corr-7", event(), json!({"document": {"cpf": "111"}}))
        .await
        .unwrap();

    assert_eq!(outcome.mode, Some(RoutingMode::Mdm));
    let record = router.tracking().get("corr-7").await.unwrap().unwrap();
    assert_eq!(record.routing_mode, Some(RoutingMode::Mdm));
    assert_eq!(record.business_key, Some(json!({"cpf": "111"})));
}

#[tokio::test]
async fn test_cancelled_dispatch_is_failed() {
    let connector = Arc::new(ScriptedConnector::new());
    let router = router(catalog().await, connector.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = router
        .handle_with_cancel("corr-8", event(), json!({}), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome.status, TrackingStatus::Failed);
    assert_eq!(outcome.reason.as_deref(), Some("dispatch cancelled"));
    assert!(outcome.report.unwrap().cancelled);
    assert!(connector.calls().is_empty());
    let record = router.tracking().get("corr-8").await.unwrap().unwrap();
    assert_eq!(record.status, TrackingStatus::Failed);
}

#[tokio::test]
async fn test_matching_webhooks_are_notified() {
    let catalog = catalog().await;
    catalog
        .add_webhook_subscription(WebhookSubscription::new("erp", "driver.*", "https://erp/hooks/driver"))
        .await;
    catalog
        .add_webhook_subscription(WebhookSubscription::new("erp", "vehicle.create", "https://erp/hooks/vehicle"))
        .await;
    catalog
        .add_webhook_subscription(WebhookSubscription::new("crm", "*", "https://crm/hooks"))
        .await;
    let notifier = Arc::new(RecordingNotifier::default());
    let router = IntegrationRouter::builder(catalog, Arc::new(ScriptedConnector::new()))
        .notifier(notifier.clone())
        .build();

    let outcome = router.handle("corr-9", event(), json!({})).await.unwrap();
    assert_eq!(outcome.webhooks_notified, 1);

    let sent = notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let (url, payload) = &sent[0];
    assert_eq!(url, "https://erp/hooks/driver");
    assert_eq!(payload.event, "driver.create");
    assert_eq!(payload.correlation_id, "corr-9");
    assert_eq!(payload.status, TrackingStatus::Success);

    let record = router.tracking().get("corr-9").await.unwrap().unwrap();
    assert!(record.webhook_delivered);
    assert_eq!(record.status, TrackingStatus::Success);
    assert_eq!(
        record.steps.last().map(|s| s.step),
        Some(TrackingStepName::WebhookDispatched)
    );
}

/// Catch-all erp subscription with the given retry policy
async fn subscribe(catalog: &InMemoryCatalog, url: &str, retry: Option<WebhookRetryPolicy>) {
    let mut subscription = WebhookSubscription::new("erp", "*", url);
    subscription.retry_policy = retry;
    catalog.add_webhook_subscription(subscription).await;
}

fn quick_retries(max_retries: u32) -> Option<WebhookRetryPolicy> {
    Some(WebhookRetryPolicy {
        max_retries,
        backoff_ms: vec![1, 1],
    })
}

#[tokio::test]
async fn test_webhook_is_retried_until_accepted() {
    let catalog = catalog().await;
    subscribe(&catalog, "https://erp/hooks", quick_retries(3)).await;
    let notifier = Arc::new(FlakyNotifier::new(2));
    let router = IntegrationRouter::builder(catalog, Arc::new(ScriptedConnector::new()))
        .notifier(notifier.clone())
        .build();

    let outcome = router.handle("corr-11", event(), json!({})).await.unwrap();

    assert_eq!(outcome.webhooks_notified, 1);
    assert_eq!(notifier.attempt_count(), 3);
    let record = router.tracking().get("corr-11").await.unwrap().unwrap();
    assert!(record.webhook_delivered);
    let last = record.steps.last().unwrap();
    assert_eq!(last.step, TrackingStepName::WebhookDispatched);
    assert_eq!(last.status, TrackingStatus::Success);
}

#[tokio::test]
async fn test_exhausted_webhook_is_tracked_as_failed() {
    let catalog = catalog().await;
    subscribe(&catalog, "https://erp/hooks", quick_retries(1)).await;
    let notifier = Arc::new(FlakyNotifier::always_failing());
    let router = IntegrationRouter::builder(catalog, Arc::new(ScriptedConnector::new()))
        .notifier(notifier.clone())
        .build();

    let outcome = router.handle("corr-12", event(), json!({})).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.webhooks_notified, 0);
    assert_eq!(notifier.attempt_count(), 2);

    let record = router.tracking().get("corr-12").await.unwrap().unwrap();
    assert!(!record.webhook_delivered);
    assert_eq!(record.status, TrackingStatus::Success);
    let last = record.steps.last().unwrap();
    assert_eq!(last.step, TrackingStepName::WebhookDispatched);
    assert_eq!(last.status, TrackingStatus::Failed);
    assert!(last.status_reason.as_deref().unwrap_or_default().contains("https://erp/hooks"));
}

#[tokio::test]
async fn test_cancel_interrupts_webhook_backoff() {
    let catalog = catalog().await;
    // Default policy: 1s, 5s and 30s between attempts.
    subscribe(&catalog, "https://erp/hooks", None).await;
    let notifier = Arc::new(FlakyNotifier::always_failing());
    let router = IntegrationRouter::builder(catalog, Arc::new(ScriptedConnector::new()))
        .notifier(notifier.clone())
        .build();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let outcome = router
        .handle_with_cancel("corr-13", event(), json!({}), &cancel)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(outcome.is_success());
    assert_eq!(outcome.webhooks_notified, 0);
    assert_eq!(notifier.attempt_count(), 1);
    let record = router.tracking().get("corr-13").await.unwrap().unwrap();
    assert!(!record.webhook_delivered);
    let last = record.steps.last().unwrap();
    assert_eq!(last.step, TrackingStepName::WebhookDispatched);
    assert_eq!(last.status, TrackingStatus::Failed);
    assert!(last.status_reason.as_deref().unwrap_or_default().contains("cancelled"));
}

#[tokio::test]
async fn test_cancelled_request_makes_no_webhook_attempt() {
    let catalog = catalog().await;
    subscribe(&catalog, "https://erp/hooks", None).await;
    let notifier = Arc::new(FlakyNotifier::always_failing());
    let router = IntegrationRouter::builder(catalog, Arc::new(ScriptedConnector::new()))
        .notifier(notifier.clone())
        .build();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let started = Instant::now();
    let outcome = router
        .handle_with_cancel("corr-14", event(), json!({}), &cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(outcome.status, TrackingStatus::Failed);
    assert_eq!(notifier.attempt_count(), 0);
    let record = router.tracking().get("corr-14").await.unwrap().unwrap();
    let last = record.steps.last().unwrap();
    assert_eq!(last.step, TrackingStepName::WebhookDispatched);
    assert_eq!(last.status, TrackingStatus::Failed);
}

#[tokio::test]
async fn test_rules_published_after_start_route_once_cache_is_invalidated() {
    let catalog = catalog().await;
    let connector = Arc::new(ScriptedConnector::new());
    let router = router(catalog.clone(), connector.clone());
    let cargo = || RoutingKey::new("erp", "cargo", "create");

    let outcome = router.handle("corr-15", cargo(), json!({})).await.unwrap();
    assert_eq!(outcome.status, TrackingStatus::Discarded);

    catalog
        .publish_inbound(InboundRule::new("erp", "cargo", "create", 1))
        .await
        .unwrap();
    catalog.publish_endpoint(endpoint("tms", "cargo")).await.unwrap();
    catalog
        .publish_outbound(OutboundRule::new("erp", "cargo", "create", "tms"))
        .await
        .unwrap();

    // The miss is still cached.
    let outcome = router.handle("corr-16", cargo(), json!({})).await.unwrap();
    assert_eq!(outcome.status, TrackingStatus::Discarded);

    router.invalidate_catalog();
    let outcome = router.handle("corr-17", cargo(), json!({})).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(connector.calls(), vec!["tms"]);
}

#[tokio::test]
async fn test_blank_correlation_id_is_rejected() {
    let router = router(catalog().await, Arc::new(ScriptedConnector::new()));
    let err = router.handle("", event(), json!({})).await.unwrap_err();
    assert!(matches!(err, RouterError::InvalidInput(_)));
}

#[tokio::test]
async fn test_generated_correlation_id_and_uncached_catalog() {
    let catalog = catalog().await;
    let mut settings = Settings::default();
    settings.catalog.cache_ttl_ms = 0;
    let router = IntegrationRouter::builder(catalog.clone(), Arc::new(ScriptedConnector::new()))
        .settings(settings)
        .build();

    let outcome = router.handle_event(event(), json!({})).await.unwrap();
    assert!(uuid::Uuid::parse_str(&outcome.correlation_id).is_ok());

    // Without a cache, a newly published rule is seen on the next event.
    catalog
        .publish_inbound(InboundRule::new("erp", "cargo", "create", 1))
        .await
        .unwrap();
    let outcome = router
        .handle_event(RoutingKey::new("erp", "cargo", "create"), json!({}))
        .await
        .unwrap();
    assert_eq!(outcome.status, TrackingStatus::Discarded);
    assert!(outcome.reason.unwrap().starts_with("no outbound destination"));
}

#[test]
fn test_outcome_serializes_camel_case() {
    let outcome = tokio_test::block_on(async {
        let router = router(catalog().await, Arc::new(ScriptedConnector::new()));
        router.handle("corr-10", event(), json!({})).await.unwrap()
    });
    let value = serde_json::to_value(&outcome).unwrap();
    assert_eq!(value["correlationId"], json!("corr-10"));
    assert_eq!(value["status"], json!("success"));
    assert_eq!(value["webhooksNotified"], json!(0));
}
