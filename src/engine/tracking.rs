// Tracking recorder
// Idempotent, append-only upsert of pipeline steps per correlation id

//! # Tracking Recorder
//!
//! [`TrackingRecorder::record_step`] is the single write path into the
//! tracking aggregate. The first step for a correlation id creates the
//! record; later steps are appended atomically and the aggregate is
//! recomputed with [`TrackingRecord::apply_step`].
//!
//! ## Atomicity
//!
//! A [`TrackingStore`] must apply "load, append, recompute, save" as one
//! conditional update per correlation id. The in-memory store does this under
//! the `DashMap` entry lock, so concurrent steps from different services
//! never lose each other.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::models::{TrackingRecord, TrackingSeed, TrackingStep};
use crate::{Result, RouterError};

/// Persistence for tracking aggregates
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Create or update the record and append `step`, atomically
    async fn upsert_step(
        &self,
        correlation_id: &str,
        seed: &TrackingSeed,
        step: TrackingStep,
    ) -> Result<TrackingRecord>;

    async fn get(&self, correlation_id: &str) -> Result<Option<TrackingRecord>>;

    async fn mark_webhook_delivered(&self, correlation_id: &str) -> Result<TrackingRecord>;
}

#[derive(Default)]
pub struct InMemoryTrackingStore {
    records: DashMap<String, TrackingRecord>,
}

impl InMemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl TrackingStore for InMemoryTrackingStore {
    async fn upsert_step(
        &self,
        correlation_id: &str,
        seed: &TrackingSeed,
        step: TrackingStep,
    ) -> Result<TrackingRecord> {
        let now = Utc::now();
        let mut record = self
            .records
            .entry(correlation_id.to_string())
            .or_insert_with(|| TrackingRecord::new(correlation_id, now));
        record.merge_seed(seed);
        record.apply_step(step, now);
        Ok(record.clone())
    }

    async fn get(&self, correlation_id: &str) -> Result<Option<TrackingRecord>> {
        Ok(self.records.get(correlation_id).map(|record| record.clone()))
    }

    async fn mark_webhook_delivered(&self, correlation_id: &str) -> Result<TrackingRecord> {
        let mut record = self
            .records
            .get_mut(correlation_id)
            .ok_or_else(|| RouterError::NotFound(format!("tracking record {}", correlation_id)))?;
        record.mark_webhook_delivered(Utc::now());
        Ok(record.clone())
    }
}

pub struct TrackingRecorder {
    store: Arc<dyn TrackingStore>,
    service_name: String,
}

impl TrackingRecorder {
    pub fn new(store: Arc<dyn TrackingStore>) -> Self {
        Self {
            store,
            service_name: "middleware-esb".to_string(),
        }
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Append a step and return the recomputed aggregate
    pub async fn record_step(
        &self,
        correlation_id: &str,
        seed: &TrackingSeed,
        step: TrackingStep,
    ) -> Result<TrackingRecord> {
        if correlation_id.trim().is_empty() {
            return Err(RouterError::InvalidInput(
                "tracking requires a correlation id".to_string(),
            ));
        }
        let step_name = step.step;
        let step_status = step.status;
        let target = step.agent.clone();

        let record = self.store.upsert_step(correlation_id, seed, step).await?;

        debug!(
            service = %self.service_name,
            correlation_id,
            step = ?step_name,
            step_status = %step_status,
            destination = ?target,
            status = %record.status,
            steps = record.steps.len(),
            "Tracking step recorded"
        );
        if record.status.is_terminal() && record.driven_by == Some(step_name) && target.is_none() {
            info!(
                service = %self.service_name,
                correlation_id,
                status = %record.status,
                reason = ?record.status_reason,
                lifetime_ms = ?record.duration_lifetime_ms,
                "Tracking reached terminal status"
            );
        }
        Ok(record)
    }

    pub async fn get(&self, correlation_id: &str) -> Result<Option<TrackingRecord>> {
        self.store.get(correlation_id).await
    }

    pub async fn mark_webhook_delivered(&self, correlation_id: &str) -> Result<TrackingRecord> {
        self.store.mark_webhook_delivered(correlation_id).await
    }
}
