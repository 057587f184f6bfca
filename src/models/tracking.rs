// End-to-end tracking aggregate

//! # Tracking Models
//!
//! Every event that enters the router gets one [`TrackingRecord`], keyed by
//! its correlation id. Each pipeline stage appends a [`TrackingStep`]; the
//! record's top level `status` and `current_step` are recomputed from the
//! step that was just appended.
//!
//! Appending is unconditional. Recomputing is not:
//!
//! 1. A terminal status (`success`, `failed`, `discarded`) never falls back to
//!    a non-terminal one.
//! 2. A step from an earlier pipeline stage than the one that last drove the
//!    record does not move it backwards.
//! 3. Per-target fan-out steps (those carrying `agent`) only report progress.
//!    The overall outcome of a fan-out is written by an unscoped step.
//!
//! ## Rust Learning Notes:
//!
//! ### Pure State Transitions
//! [`TrackingRecord::apply_step`] is a plain `&mut self` method with no I/O.
//! The store wraps it in whatever atomicity it has (a `DashMap` entry lock in
//! memory). Keeping the transition pure lets tests exercise every ordering
//! without any async machinery.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::routing::RoutingMode;

/// Status of a step and of the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingStatus {
    Pending,
    Success,
    Failed,
    Retrying,
    Discarded,
}

impl TrackingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrackingStatus::Success | TrackingStatus::Failed | TrackingStatus::Discarded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackingStatus::Pending => "pending",
            TrackingStatus::Success => "success",
            TrackingStatus::Failed => "failed",
            TrackingStatus::Retrying => "retrying",
            TrackingStatus::Discarded => "discarded",
        }
    }
}

impl fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage that produced a step, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStepName {
    ApiReceived,
    EsbProcessing,
    EsbRouted,
    MdmProcessing,
    MdmCompleted,
    MdmRoutingOutbound,
    OutboundSending,
    OutboundResponse,
    WebhookDispatched,
}

impl TrackingStepName {
    /// Webhook steps are audit entries for notifications about an already final record
    pub fn drives_status(self) -> bool {
        self != TrackingStepName::WebhookDispatched
    }

    fn in_progress(self) -> TrackingCurrentStep {
        match self {
            TrackingStepName::ApiReceived => TrackingCurrentStep::Received,
            TrackingStepName::EsbProcessing => TrackingCurrentStep::ProcessingEsb,
            TrackingStepName::EsbRouted => TrackingCurrentStep::Routed,
            TrackingStepName::MdmProcessing | TrackingStepName::MdmCompleted => {
                TrackingCurrentStep::ProcessingMdm
            }
            TrackingStepName::MdmRoutingOutbound
            | TrackingStepName::OutboundSending
            | TrackingStepName::OutboundResponse
            | TrackingStepName::WebhookDispatched => TrackingCurrentStep::ProcessingOutbound,
        }
    }
}

/// Service that wrote a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingService {
    #[serde(rename = "middleware-api")]
    ApiHub,
    #[serde(rename = "middleware-esb")]
    Esb,
    #[serde(rename = "middleware-mdm-service")]
    MdmService,
    #[serde(rename = "middleware-integration-connectors")]
    Connectors,
    #[serde(rename = "middleware-webhook")]
    Webhook,
}

/// Where the pipeline currently is, as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingCurrentStep {
    Received,
    ProcessingEsb,
    Routed,
    ProcessingMdm,
    ProcessingOutbound,
    Completed,
    Failed,
    Discarded,
}

impl TrackingCurrentStep {
    pub fn for_step(step: TrackingStepName, status: TrackingStatus) -> Self {
        match status {
            TrackingStatus::Success => TrackingCurrentStep::Completed,
            TrackingStatus::Failed => TrackingCurrentStep::Failed,
            TrackingStatus::Discarded => TrackingCurrentStep::Discarded,
            TrackingStatus::Pending | TrackingStatus::Retrying => step.in_progress(),
        }
    }
}

/// One immutable entry in a record's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStep {
    pub step: TrackingStepName,
    pub service: TrackingService,
    pub status: TrackingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Destination agent for fan-out steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub timestamp_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl TrackingStep {
    pub fn new(step: TrackingStepName, service: TrackingService, status: TrackingStatus) -> Self {
        Self {
            step,
            service,
            status,
            status_reason: None,
            agent: None,
            timestamp_start: Utc::now(),
            timestamp_end: None,
            duration_ms: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.status_reason = Some(reason.into());
        self
    }

    pub fn for_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn started_at(mut self, start: DateTime<Utc>) -> Self {
        self.timestamp_start = start;
        self
    }

    /// Close the step and compute its duration
    pub fn finished_at(mut self, end: DateTime<Utc>) -> Self {
        self.duration_ms = Some((end - self.timestamp_start).num_milliseconds().max(0));
        self.timestamp_end = Some(end);
        self
    }
}

/// Record-level context supplied alongside a step
///
/// Fields left as `None` keep whatever the record already holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSeed {
    pub agent: Option<String>,
    pub entity: Option<String>,
    pub action: Option<String>,
    pub business_key: Option<Value>,
    pub routing_mode: Option<RoutingMode>,
}

impl TrackingSeed {
    pub fn new(agent: &str, entity: &str, action: &str) -> Self {
        Self {
            agent: Some(agent.to_string()),
            entity: Some(entity.to_string()),
            action: Some(action.to_string()),
            business_key: None,
            routing_mode: None,
        }
    }

    pub fn with_business_key(mut self, key: Value) -> Self {
        self.business_key = Some(key);
        self
    }

    pub fn with_routing_mode(mut self, mode: RoutingMode) -> Self {
        self.routing_mode = Some(mode);
        self
    }
}

/// Aggregate tracking state for one correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingRecord {
    pub correlation_id: String,
    pub agent: String,
    pub entity: String,
    pub action: String,
    pub business_key: Option<Value>,
    pub routing_mode: Option<RoutingMode>,
    pub status: TrackingStatus,
    pub status_reason: Option<String>,
    pub current_step: TrackingCurrentStep,
    pub steps: Vec<TrackingStep>,
    pub webhook_delivered: bool,
    pub webhook_delivered_at: Option<DateTime<Utc>>,
    pub timestamp_end: Option<DateTime<Utc>>,
    pub duration_lifetime_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stage of the step that last moved status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driven_by: Option<TrackingStepName>,
}

impl TrackingRecord {
    pub fn new(correlation_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            agent: String::new(),
            entity: String::new(),
            action: String::new(),
            business_key: None,
            routing_mode: None,
            status: TrackingStatus::Pending,
            status_reason: None,
            current_step: TrackingCurrentStep::Received,
            steps: Vec::new(),
            webhook_delivered: false,
            webhook_delivered_at: None,
            timestamp_end: None,
            duration_lifetime_ms: None,
            created_at: now,
            updated_at: now,
            driven_by: None,
        }
    }

    pub fn merge_seed(&mut self, seed: &TrackingSeed) {
        if let Some(agent) = &seed.agent {
            self.agent = agent.clone();
        }
        if let Some(entity) = &seed.entity {
            self.entity = entity.clone();
        }
        if let Some(action) = &seed.action {
            self.action = action.clone();
        }
        if let Some(key) = &seed.business_key {
            self.business_key = Some(key.clone());
        }
        if let Some(mode) = seed.routing_mode {
            self.routing_mode = Some(mode);
        }
    }

    /// Whether `step` is allowed to move the aggregate
    pub fn is_driven_by(&self, step: &TrackingStep) -> bool {
        if !step.step.drives_status() {
            return false;
        }
        if step.agent.is_some() && step.status.is_terminal() {
            return false;
        }
        if self.status.is_terminal() && !step.status.is_terminal() {
            return false;
        }
        match self.driven_by {
            Some(stage) => step.step >= stage,
            None => true,
        }
    }

    /// Append `step` and recompute the aggregate from it
    pub fn apply_step(&mut self, step: TrackingStep, now: DateTime<Utc>) {
        let drives = self.is_driven_by(&step);
        self.updated_at = now;

        if drives {
            let was_terminal = self.status.is_terminal();
            self.status = step.status;
            self.status_reason = step.status_reason.clone();
            self.current_step = TrackingCurrentStep::for_step(step.step, step.status);
            self.driven_by = Some(step.step);

            if step.status.is_terminal() && !was_terminal {
                let end = step.timestamp_end.unwrap_or(now);
                self.timestamp_end = Some(end);
                self.duration_lifetime_ms = Some((end - self.created_at).num_milliseconds().max(0));
            }
        }

        self.steps.push(step);
    }

    pub fn mark_webhook_delivered(&mut self, now: DateTime<Utc>) {
        self.webhook_delivered = true;
        self.webhook_delivered_at = Some(now);
        self.updated_at = now;
    }

    /// `entity.action` event name used by webhook subscriptions
    pub fn event_name(&self) -> String {
        format!("{}.{}", self.entity, self.action)
    }
}

/// Notification body produced for webhook subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: String,
    pub correlation_id: String,
    pub status: TrackingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub entity: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<Value>,
}

impl WebhookPayload {
    pub fn from_record(record: &TrackingRecord) -> Self {
        Self {
            event: record.event_name(),
            correlation_id: record.correlation_id.clone(),
            status: record.status,
            status_reason: record.status_reason.clone(),
            timestamp: record.timestamp_end.unwrap_or(record.updated_at),
            agent: record.agent.clone(),
            entity: record.entity.clone(),
            action: record.action.clone(),
            business_key: record.business_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn step(name: TrackingStepName, status: TrackingStatus) -> TrackingStep {
        TrackingStep::new(name, TrackingService::Esb, status)
    }

    #[test]
    fn test_first_step_sets_status() {
        let now = Utc::now();
        let mut record = TrackingRecord::new("c-1", now);
        record.apply_step(step(TrackingStepName::EsbProcessing, TrackingStatus::Pending), now);

        assert_eq!(record.status, TrackingStatus::Pending);
        assert_eq!(record.current_step, TrackingCurrentStep::ProcessingEsb);
        assert_eq!(record.steps.len(), 1);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let now = Utc::now();
        let mut record = TrackingRecord::new("c-1", now);
        record.apply_step(
            step(TrackingStepName::OutboundResponse, TrackingStatus::Success),
            now,
        );
        record.apply_step(
            step(TrackingStepName::OutboundResponse, TrackingStatus::Pending),
            now,
        );

        assert_eq!(record.status, TrackingStatus::Success);
        assert_eq!(record.current_step, TrackingCurrentStep::Completed);
        assert_eq!(record.steps.len(), 2);
    }

    #[test]
    fn test_earlier_stage_does_not_regress() {
        let now = Utc::now();
        let mut record = TrackingRecord::new("c-1", now);
        record.apply_step(step(TrackingStepName::EsbRouted, TrackingStatus::Pending), now);
        record.apply_step(step(TrackingStepName::ApiReceived, TrackingStatus::Pending), now);

        assert_eq!(record.current_step, TrackingCurrentStep::Routed);
        assert_eq!(record.driven_by, Some(TrackingStepName::EsbRouted));
    }

    #[test]
    fn test_fan_out_steps_report_progress_only() {
        let now = Utc::now();
        let mut record = TrackingRecord::new("c-1", now);
        record.apply_step(
            step(TrackingStepName::OutboundSending, TrackingStatus::Retrying).for_agent("wms"),
            now,
        );
        assert_eq!(record.status, TrackingStatus::Retrying);

        record.apply_step(
            step(TrackingStepName::OutboundResponse, TrackingStatus::Failed).for_agent("wms"),
            now,
        );
        assert_eq!(record.status, TrackingStatus::Retrying);
        assert_eq!(record.steps.len(), 2);
    }

    #[test]
    fn test_terminal_sets_lifetime() {
        let created = Utc::now();
        let mut record = TrackingRecord::new("c-1", created);
        let end = created + Duration::milliseconds(250);
        record.apply_step(
            step(TrackingStepName::OutboundResponse, TrackingStatus::Failed)
                .with_reason("boom")
                .started_at(created)
                .finished_at(end),
            end,
        );

        assert_eq!(record.timestamp_end, Some(end));
        assert_eq!(record.duration_lifetime_ms, Some(250));
        assert_eq!(record.status_reason.as_deref(), Some("boom"));
        assert_eq!(record.steps[0].duration_ms, Some(250));
    }

    #[test]
    fn test_webhook_step_never_drives() {
        let now = Utc::now();
        let mut record = TrackingRecord::new("c-1", now);
        record.apply_step(step(TrackingStepName::EsbRouted, TrackingStatus::Failed), now);
        record.apply_step(
            TrackingStep::new(
                TrackingStepName::WebhookDispatched,
                TrackingService::Webhook,
                TrackingStatus::Success,
            ),
            now,
        );
        assert_eq!(record.status, TrackingStatus::Failed);
    }

    #[test]
    fn test_webhook_payload_shape() {
        let now = Utc::now();
        let mut record = TrackingRecord::new("c-9", now);
        record.merge_seed(
            &TrackingSeed::new("erp", "driver", "update")
                .with_business_key(serde_json::json!({"document": "123"})),
        );
        record.apply_step(step(TrackingStepName::EsbRouted, TrackingStatus::Discarded), now);

        let payload = serde_json::to_value(WebhookPayload::from_record(&record)).unwrap();
        assert_eq!(payload["event"], "driver.update");
        assert_eq!(payload["correlationId"], "c-9");
        assert_eq!(payload["status"], "discarded");
        assert_eq!(payload["businessKey"]["document"], "123");
        assert!(payload.get("statusReason").is_none());
    }
}
