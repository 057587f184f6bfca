// Integration Router - Rust Edition
// Routing resolution and conditional dispatch core for an integration hub

//! # Integration Router Library
//!
//! This is the library crate for the integration router: the part of an
//! integration hub that decides, for every incoming event, which inbound rule
//! owns it, what canonical entity/action it becomes once its payload is
//! inspected, and which destination agents receive it in which order.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`ActionPattern`]: exact / list / wildcard action selectors
//! - [`ConditionNode`]: `all` / `any` / comparison trees over JSON payloads
//! - [`InboundRule`] / [`OutboundRule`]: versioned routing definitions
//! - [`Endpoint`]: delivery target with retry, rate limit and breaker policies
//! - [`TrackingRecord`]: end-to-end status of one correlation id
//!
//! ### Engine
//!
//! #### [`IntegrationRouter`] - End-to-End Flow
//!
//! Wires every stage together:
//!
//! 1. [`InboundResolver`] picks the inbound rule and applies conditional re-routing
//! 2. [`OutboundPlanner`] filters outbound rules and orders them into waves
//! 3. [`Dispatcher`] runs the waves through the [`DeliveryGate`]
//! 4. [`TrackingRecorder`] records each stage and the final outcome
//!
//! **Usage Example:**
//! ```rust,ignore
//! use std::sync::Arc;
//! use integration_router::{InMemoryCatalog, IntegrationRouter, RoutingKey};
//!
//! let catalog = Arc::new(InMemoryCatalog::new());
//! // publish rules and endpoints, then:
//! let router = IntegrationRouter::builder(catalog, Arc::new(my_connector)).build();
//! let outcome = router
//!     .handle("corr-1", RoutingKey::new("erp", "driver", "update"), payload)
//!     .await?;
//! ```
//!
//! ### Configuration
//! [`Settings`] is loaded with the `config` crate from defaults, an optional
//! file and `ROUTER__*` environment variables.
//!
//! ## Rust Learning Notes:
//!
//! ### Module System
//! Each `mod` declaration tells Rust to include code from either a `.rs`
//! file or a directory with a `mod.rs` file.
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure.

// Core domain models
pub mod models;

// Resolution, planning, delivery and tracking engines
pub mod engine;

// Layered runtime settings
pub mod config;

pub use models::{
    ActionPattern,       // Parsed rule action selector
    ConditionNode,       // Condition tree
    Endpoint,            // Delivery target
    ErrorClassification, // Retry classification of delivery failures
    ErrorType,           // Error label used in tracking reasons
    InboundRule,         // Source-side routing definition
    MatchRank,           // Precedence of an action match
    OutboundRule,        // Destination-side routing definition
    RoutingKey,          // (agent, entity, action)
    RoutingMode,         // direct / ods / mdm
    TrackingRecord,      // Per-correlation aggregate
    TrackingStatus,      // pending / success / failed / retrying / discarded
};

pub use engine::{
    catalog::{CachedCatalog, InMemoryCatalog, RuleCatalog},
    connector::{Connector, IdentityTransformer, PayloadTransformer, WebhookNotifier},
    dispatcher::{DispatchReport, Dispatcher, UnitOutcome},
    gate::{Admission, DeliveryGate, GateStateStore, InMemoryGateStore},
    inbound::{InboundResolution, InboundResolver, ResolvedRoute},
    outbound::{DispatchPlan, DispatchUnit, OutboundPlanner, SkipReason},
    router::{IntegrationRouter, RoutingOutcome},
    tracking::{InMemoryTrackingStore, TrackingRecorder, TrackingStore},
};

pub use crate::config::Settings;

use thiserror::Error;

use crate::models::{DeliveryError, EvaluationError};

/// Errors raised by the routing engine
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion with the `?` operator
///
/// An event that matches no rule is **not** an error. It is reported as a
/// discarded [`RoutingOutcome`].
#[derive(Error, Debug)]
pub enum RouterError {
    /// Malformed rule, condition, regex or dependency graph
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A condition could not be evaluated against the payload
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    /// A dispatch attempt failed
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// The endpoint's breaker is open
    #[error("Circuit open for {endpoint}, retry after {retry_after_ms}ms")]
    CircuitOpen { endpoint: String, retry_after_ms: u64 },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The caller aborted the request
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Catalog or tracking store failures
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    /// Wrap an evaluation failure, promoting configuration problems
    pub fn from_evaluation(err: EvaluationError) -> Self {
        if err.is_configuration() {
            RouterError::Configuration(err.to_string())
        } else {
            RouterError::Evaluation(err)
        }
    }

    /// Label used when this error ends up in a tracking reason
    pub fn error_type(&self) -> ErrorType {
        match self {
            RouterError::Delivery(err) => err.error_type(),
            RouterError::Configuration(_) | RouterError::Config(_) => ErrorType::ApplicationFatal,
            RouterError::InvalidInput(_) => ErrorType::Business,
            _ => ErrorType::Application,
        }
    }
}

impl From<std::io::Error> for RouterError {
    fn from(err: std::io::Error) -> Self {
        RouterError::Internal(err.to_string())
    }
}

/// Type alias for Results that use the router error type
pub type Result<T> = std::result::Result<T, RouterError>;
