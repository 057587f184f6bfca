// Webhook subscriptions

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Event pattern that matches every event
pub const ANY_EVENT: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: Vec<u64>,
}

impl Default for WebhookRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: vec![1_000, 5_000, 30_000],
        }
    }
}

/// A partner system's request to be told about finished events
///
/// `event` is `entity.action`, `entity.*` or `*`. Signing secrets and HTTP
/// delivery belong to the notifier, not to this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscription {
    #[serde(default)]
    pub id: Option<String>,
    pub agent_name: String,
    pub event: String,
    pub target_url: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub retry_policy: Option<WebhookRetryPolicy>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub description: Option<String>,
}

impl WebhookSubscription {
    pub fn new(agent_name: &str, event: &str, target_url: &str) -> Self {
        Self {
            id: None,
            agent_name: agent_name.to_string(),
            event: event.to_string(),
            target_url: target_url.to_string(),
            is_active: true,
            retry_policy: None,
            headers: None,
            description: None,
        }
    }

    /// Does this subscription want `entity.action`?
    pub fn matches_event(&self, entity: &str, action: &str) -> bool {
        let pattern = self.event.trim();
        if pattern == ANY_EVENT {
            return true;
        }
        match pattern.split_once('.') {
            Some((sub_entity, "*")) => sub_entity == entity,
            Some((sub_entity, sub_action)) => sub_entity == entity && sub_action == action,
            None => false,
        }
    }

    pub fn effective_retry_policy(&self) -> WebhookRetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }
}

fn default_active() -> bool {
    true
}
