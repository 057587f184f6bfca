// Domain models for the integration router
// Plain value types loaded from the rule catalog and produced by the pipeline

//! # Domain Models Module
//!
//! This module contains the data the router works on. Everything here is a
//! plain value: rules, endpoints and subscriptions are read from a catalog
//! and never mutated by the routing engine, while tracking records are owned
//! by the tracking store.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization
//! This `mod.rs` file is the **module root** for the `models` directory.
//! Each `pub mod` line pulls in the matching `.rs` file as a submodule.
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API, so callers can
//! write `use integration_router::models::InboundRule` instead of reaching
//! into `models::routing`.

// Action patterns and version-aware rule selection
pub mod action;

// Condition trees evaluated against canonical payloads
pub mod condition;

// Routing keys, inbound and outbound rules, entities
pub mod routing;

// Delivery targets and their reliability policies
pub mod endpoint;

// Connector results and failure classification
pub mod delivery;

// Per-correlation tracking aggregate and webhook payloads
pub mod tracking;

// Webhook subscriptions
pub mod webhook;

/// Action matching
/// - ActionPattern: Exact / Set / Wildcard / Empty selector
/// - MatchRank: precedence of a match
/// - Versioned + select_best: one selection routine for every rule type
pub use action::{select_best, ActionPattern, MatchRank, Versioned, WILDCARD_ACTION};

/// Condition evaluation
pub use condition::{resolve_path, Comparison, ConditionNode, EvaluationError, Operator};

/// Routing definitions
pub use routing::{
    InboundRoute, InboundRule, IntegrationEntity, OnError, OutboundRule, RoutingKey, RoutingMode,
    RoutingModeOverride,
};

/// Endpoint configuration
pub use endpoint::{
    BreakerPolicy, Endpoint, EndpointConfig, HttpConfig, HttpMethod, QueueConfig,
    RateLimitPolicy, RateLimitStrategy, RetryPolicy, RetryStrategy, TlsConfig,
    TransportProtocol,
};

/// Delivery results
pub use delivery::{AttemptOutcome, ConnectorResponse, DeliveryError, ErrorClassification, ErrorType};

/// Tracking
pub use tracking::{
    TrackingCurrentStep, TrackingRecord, TrackingSeed, TrackingService, TrackingStatus,
    TrackingStep, TrackingStepName, WebhookPayload,
};

/// Webhooks
pub use webhook::{WebhookRetryPolicy, WebhookSubscription};
