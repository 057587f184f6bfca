// Collaborator interfaces
// Transport, transformation and webhook delivery live outside the router

//! Seams to the systems the router drives but does not implement.
//!
//! - [`Connector`]: sends a payload to one endpoint over its transport
//! - [`PayloadTransformer`]: evaluates a transformation expression
//! - [`WebhookNotifier`]: signs and delivers webhook notifications
//!
//! Each trait is object safe and `Send + Sync` so the router can hold them as
//! `Arc<dyn ...>` and call them from concurrent dispatch units.

use async_trait::async_trait;
use serde_json::Value;

use crate::models::{ConnectorResponse, DeliveryError, Endpoint, WebhookPayload, WebhookSubscription};
use crate::Result;

/// Delivers a payload to an endpoint
///
/// A response with a non-success status is returned as `Ok` and classified by
/// the caller; `Err` is for failures that never produced a response (DNS,
/// refused connection, timeout) and must already carry a classification.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        payload: &Value,
    ) -> std::result::Result<ConnectorResponse, DeliveryError>;
}

/// Evaluates transformation expressions stored on rules
#[async_trait]
pub trait PayloadTransformer: Send + Sync {
    async fn transform(&self, expression: &str, payload: &Value) -> Result<Value>;
}

/// Returns the payload unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

#[async_trait]
impl PayloadTransformer for IdentityTransformer {
    async fn transform(&self, _expression: &str, payload: &Value) -> Result<Value> {
        Ok(payload.clone())
    }
}

/// Delivers webhook notifications to subscribers
#[async_trait]
pub trait WebhookNotifier: Send + Sync {
    async fn notify(&self, subscription: &WebhookSubscription, payload: &WebhookPayload) -> Result<()>;
}
