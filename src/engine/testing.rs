// Test doubles shared by the engine test modules

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::engine::connector::{Connector, PayloadTransformer, WebhookNotifier};
use crate::models::{
    ConnectorResponse, DeliveryError, Endpoint, RetryPolicy, RetryStrategy, TransportProtocol,
    WebhookPayload, WebhookSubscription,
};
use crate::{Result, RouterError};

/// Connector that replays scripted answers per target agent
///
/// Targets without a script answer `200 {}`.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<String, VecDeque<std::result::Result<ConnectorResponse, DeliveryError>>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(
        self,
        target: &str,
        answers: Vec<std::result::Result<ConnectorResponse, DeliveryError>>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(target.to_string(), answers.into_iter().collect());
        self
    }

    /// Targets in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn payloads_for(&self, target: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn call_count(&self, target: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(t, _)| t == target).count()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        payload: &Value,
    ) -> std::result::Result<ConnectorResponse, DeliveryError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.agent.clone(), payload.clone()));
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&endpoint.agent)
            .and_then(VecDeque::pop_front);
        tokio::task::yield_now().await;
        next.unwrap_or_else(|| Ok(ConnectorResponse::new(200, json!({}))))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, WebhookPayload)>>,
}

#[async_trait]
impl WebhookNotifier for RecordingNotifier {
    async fn notify(&self, subscription: &WebhookSubscription, payload: &WebhookPayload) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((subscription.target_url.clone(), payload.clone()));
        Ok(())
    }
}

/// Notifier that refuses the first `failures` calls, then accepts
pub struct FlakyNotifier {
    failures_left: Mutex<u32>,
    pub attempts: Mutex<Vec<String>>,
}

impl FlakyNotifier {
    pub fn new(failures: u32) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::new(u32::MAX)
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl WebhookNotifier for FlakyNotifier {
    async fn notify(&self, subscription: &WebhookSubscription, _payload: &WebhookPayload) -> Result<()> {
        self.attempts
            .lock()
            .unwrap()
            .push(subscription.target_url.clone());
        let mut left = self.failures_left.lock().unwrap();
        if *left == 0 {
            return Ok(());
        }
        *left -= 1;
        Err(RouterError::Delivery(DeliveryError::transient(format!(
            "{} answered 503",
            subscription.target_url
        ))))
    }
}

/// Transformer that rejects every expression
pub struct RejectingTransformer;

#[async_trait]
impl PayloadTransformer for RejectingTransformer {
    async fn transform(&self, expression: &str, _payload: &Value) -> Result<Value> {
        Err(RouterError::InvalidInput(format!("cannot apply transformation {}", expression)))
    }
}

/// REST endpoint with fast, jitter-free retries
pub fn endpoint(target: &str, entity: &str) -> Endpoint {
    let mut endpoint = Endpoint::new(target, entity, "all", TransportProtocol::Rest, "http://partner");
    endpoint.retry_policy = Some(RetryPolicy {
        max_attempts: 3,
        strategy: RetryStrategy::Fixed,
        delay_ms: 1,
        max_delay_ms: None,
        jitter: false,
    });
    endpoint
}

pub fn status(code: u16) -> std::result::Result<ConnectorResponse, DeliveryError> {
    Ok(ConnectorResponse::new(code, json!({"code": code})))
}
