// Routing Engine
// Resolution, planning, delivery and tracking for routed events

//! # Routing Engine Module
//!
//! This module contains the engines that turn routing configuration into
//! deliveries. The domain models (in `models/`) say *what* a rule means; the
//! engine decides *when* and *how* it is applied.
//!
//! ## Architecture Overview
//!
//! ```text
//! IntegrationRouter
//!   ├── InboundResolver ── RuleCatalog
//!   ├── OutboundPlanner ── RuleCatalog
//!   ├── Dispatcher ─────── DeliveryGate ── Connector
//!   └── TrackingRecorder ─ TrackingStore
//! ```
//!
//! ## Engine Components
//!
//! ### Catalog (`catalog` module)
//! - Read interface over inbound/outbound rules, endpoints, entities and webhooks
//! - In-memory implementation with version-series publishing
//! - TTL cache decorator for any catalog
//!
//! ### Inbound Resolver (`inbound` module)
//! - Picks the rule that owns an observed event
//! - Applies conditional entity/action re-routing
//!
//! ### Outbound Planner (`outbound` module)
//! - Filters outbound rules by their conditions
//! - Orders destinations into dependency waves, rejecting cycles
//!
//! ### Delivery Gate (`gate` module)
//! - Circuit breaker, rate limiter, retry decision and concurrency slots per endpoint
//!
//! ### Dispatcher (`dispatcher` module)
//! - Executes waves with barriers, retries and cancellation
//!
//! ### Tracking (`tracking` module)
//! - Atomic append of pipeline steps into a per-correlation aggregate
//!
//! ### Router (`router` module)
//! - End-to-end flow from received event to terminal status and webhooks
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! This is a common Rust pattern for organizing large modules:
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for clean API
//!
//! ### Test-only Modules
//! `#[cfg(test)] mod testing;` compiles shared test doubles only for
//! `cargo test`, so they never ship in the library.

/// Routing configuration lookups
pub mod catalog;

/// Collaborator traits: transport, transformation, webhooks
pub mod connector;

/// Inbound rule selection and re-routing
pub mod inbound;

/// Outbound dispatch planning
pub mod outbound;

/// Per-endpoint breaker, limiter and retry policy
pub mod gate;

/// Wave execution of dispatch plans
pub mod dispatcher;

/// Tracking aggregate recorder and stores
pub mod tracking;

/// End-to-end event routing
pub mod router;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod router_tests;

pub use catalog::{CachedCatalog, CatalogSnapshot, InMemoryCatalog, RuleCatalog};
pub use connector::{Connector, IdentityTransformer, PayloadTransformer, WebhookNotifier};
pub use dispatcher::{DispatchReport, Dispatcher, UnitOutcome};
pub use gate::{
    Admission, BreakerStatus, Clock, DeliveryGate, GateStateStore, InMemoryGateStore,
    ManualClock, SystemClock,
};
pub use inbound::{InboundResolution, InboundResolver, ResolvedRoute};
pub use outbound::{build_plan, DispatchPlan, DispatchUnit, OutboundPlanner, SkipReason};
pub use router::{IntegrationRouter, IntegrationRouterBuilder, RoutingOutcome};
pub use tracking::{InMemoryTrackingStore, TrackingRecorder, TrackingStore};
