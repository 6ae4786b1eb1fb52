// Kainos Engine
// Resilient execution, trigger translation and trigger lifecycle

//! # Engine Module
//!
//! Everything between the HTTP surface and the external collaborators lives
//! here. Domain types come from `models/`, the event bus from `bus/`.
//!
//! ## Architecture Overview
//!
//! - **Resilient Call Executor**: `breaker` and `resilient` guard outbound
//!   calls to the agent API
//! - **Trigger Spec Translator**: `schedule` turns schedule descriptions into
//!   trigger specs
//! - **Trigger Lifecycle**: `lifecycle` keeps subscriptions and engine
//!   triggers consistent through the `TriggerEngine` seam in `triggers`
//! - **Engines**: `local_scheduler` (in-process) and `temporal` (HTTP API of
//!   a Temporal server)
//! - **Stores**: `storage` (trait and in-memory) and `postgres`
//! - **Services**: `tenants` (onboarding) and `activities` (what a fired
//!   trigger runs)
//!
//! ## Rust Learning Notes:
//!
//! ### Traits at the Seams
//! `TriggerEngine` and `SubscriptionStore` are the only things the lifecycle
//! manager knows about its collaborators. Production wires Temporal and
//! Postgres in, tests wire the in-memory adapters in, and the manager code is
//! identical in both.

/// Three-state circuit breaker with generation-scoped counters
pub mod breaker;

/// HTTP client that runs every call through a breaker
///
/// Contains:
/// - RetryPolicy for idempotent requests
/// - Status mapping to typed errors
pub mod resilient;

/// Schedule presets and `HH:MM` literals to trigger specs
pub mod schedule;

/// Store abstraction for tenants, subscriptions and runs
///
/// Contains:
/// - SubscriptionStore trait with compare-and-swap updates
/// - In-memory implementation for development/testing
pub mod storage;

/// Postgres implementation of the store
pub mod postgres;

/// Trigger engine seam and the in-memory engine
pub mod triggers;

/// In-process trigger engine and workflow registry
pub mod local_scheduler;

/// Trigger engine backed by a Temporal server
pub mod temporal;

/// Enable, disable and reconcile subscriptions against an engine
pub mod lifecycle;

/// Entry point and activities run by fired triggers
pub mod activities;

/// Tenant onboarding and offboarding
pub mod tenants;


pub use breaker::{BreakerError, BreakerSettings, CircuitBreaker, Counts, State};
pub use lifecycle::{Drift, LifecycleConfig, ReconcileReport, TriggerLifecycleManager};
pub use local_scheduler::{LocalTriggerEngine, WorkflowRegistry};
pub use postgres::PgStore;
pub use resilient::{ResilientClient, RetryPolicy};
pub use storage::{InMemoryStore, SubscriptionStore};
pub use temporal::TemporalHttpEngine;
pub use tenants::{IdentityUser, TenantService};
pub use triggers::{InMemoryTriggerEngine, TriggerAction, TriggerEngine, TriggerHandle};
