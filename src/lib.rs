// Kainos Core - Rust Edition
// Resilient trigger-and-execution orchestration for tenant workflows

//! # Kainos Core Library
//!
//! This is the library crate behind the Kainos background-workflow platform.
//! Identity-provider webhooks create tenants, every tenant is subscribed to a
//! catalog of recurring workflows, and toggling a workflow ON or OFF keeps a
//! recurring trigger in an external execution engine in step with the database.
//!
//! ## Core Components
//!
//! ### Resilient Call Executor
//! - [`CircuitBreaker`]: three-state breaker (Closed, Open, HalfOpen) with
//!   generation-scoped counters
//! - [`ResilientClient`]: HTTP client that puts every outbound call behind one
//!   breaker and retries idempotent requests inside a single breaker outcome
//!
//! ### Trigger Spec Translator
//! - [`translate`]: maps `"daily-9am"`, `"market-open"` or `"13:45"` to a
//!   [`TriggerSpec`]
//!
//! ### Recurring Trigger Lifecycle Manager
//! - [`TriggerLifecycleManager`]: enable, disable and reconcile a
//!   [`WorkflowSubscription`] against a [`TriggerEngine`]
//!
//! ### Event Distribution Layer
//! - [`EventBus`]: publish, subscribe, queue subscribe, request/reply over a
//!   pluggable [`Transport`] (NATS or in-memory)
//!
//! ## Rust Learning Notes:
//!
//! ### Constructor Injection
//! Nothing here is a process-wide singleton. Breakers, buses and stores are
//! built once in `main` and handed to consumers as `Arc`s, which keeps every
//! component testable with in-memory adapters.

// Domain models (events, subscriptions, trigger specs)
pub mod models;

// Breaker, translator, lifecycle manager, engines and stores
pub mod engine;

// Event distribution layer and its transports
pub mod bus;

// Notification consumer (welcome and general emails)
pub mod notifier;

// HTTP surface: identity webhooks and workflow toggles
pub mod api;

// Layered configuration loading
pub mod settings;

// Component wiring shared by the binaries
pub mod server;

pub use models::{
    CatalogWorkflow, Event, EventData, Tenant, TriggerSpec, WorkflowRun, WorkflowStatus,
    WorkflowSubscription,
};

pub use engine::{
    breaker::{BreakerError, BreakerSettings, CircuitBreaker, Counts, State},
    lifecycle::{LifecycleConfig, TriggerLifecycleManager},
    resilient::{ResilientClient, RetryPolicy},
    schedule::translate,
    storage::{InMemoryStore, SubscriptionStore},
    triggers::{InMemoryTriggerEngine, TriggerAction, TriggerEngine, TriggerHandle},
};

pub use bus::{
    transport::{InMemoryTransport, Transport},
    EventBus,
};

pub use settings::AppConfig;

use std::time::Duration;
use thiserror::Error;

/// Error type shared by every Kainos operation
///
/// The variants follow the failure taxonomy the platform cares about:
/// transient infrastructure errors the caller should retry, breaker guard
/// errors that mean "do not attempt", input errors that fail before any side
/// effect, and drift/concurrency errors repaired by reconciliation.
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements `std::error::Error`
/// - `#[error("...")]` provides the `Display` message
/// - `#[from]` generates `From` impls so `?` converts automatically
#[derive(Error, Debug)]
pub enum KainosError {
    /// The breaker is Open; the operation was not attempted
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// The breaker is HalfOpen and its probe budget is used up
    #[error("Circuit breaker '{name}' rejected the call: too many half-open probes")]
    TooManyRequests { name: String },

    /// The schedule description is neither a preset nor an `HH:MM` literal
    #[error("Unknown schedule pattern: {0}")]
    UnknownSchedule(String),

    /// The bus transport is not connected; nothing was queued
    #[error("Event bus is not connected")]
    NotConnected,

    /// A bounded operation ran past its deadline
    #[error("Timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },

    /// The external execution engine rejected or failed a call
    #[error("Execution engine error: {0}")]
    Engine(String),

    /// An upstream HTTP peer answered with a server-side fault
    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// A responder answered a request with an error-typed event
    #[error("Remote handler error: {0}")]
    Remote(String),

    /// Message bus failure other than a missing connection
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Event payload did not match the expected type or shape
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Error when a record cannot be found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Error when invalid input is provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Webhook signature or credentials rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration could not be loaded or is incomplete
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// Relational store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Outbound HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KainosError {
    /// Errors the invoking layer is expected to retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KainosError::NotConnected
                | KainosError::Timeout { .. }
                | KainosError::Engine(_)
                | KainosError::Upstream { .. }
                | KainosError::Bus(_)
                | KainosError::Http(_)
                | KainosError::Storage(_)
                | KainosError::Database(_)
        )
    }

    /// Breaker guard errors: the call was never attempted
    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            KainosError::CircuitOpen { .. } | KainosError::TooManyRequests { .. }
        )
    }
}

impl From<::config::ConfigError> for KainosError {
    fn from(err: ::config::ConfigError) -> Self {
        KainosError::Config(err.to_string())
    }
}

impl From<std::io::Error> for KainosError {
    fn from(err: std::io::Error) -> Self {
        KainosError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, KainosError>;
