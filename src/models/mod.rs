// Core domain models for Kainos
// Plain data: events, tenant subscriptions, trigger specs

//! # Domain Models Module
//!
//! Data structures shared by the engine, the bus and the HTTP layer. Nothing
//! in here performs I/O.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API.
//! Users can import `use kainos::models::Event` instead of
//! `use kainos::models::event::Event`.

// Wire events and their typed payloads
pub mod event;

// Tenants, catalog workflows, subscriptions and run records
pub mod subscription;

// Calendar trigger specs produced by the schedule translator
pub mod trigger;

pub use event::{
    EmailInfo, EmailKind, EmailRequested, ErrorReply, Event, EventData, EventPayload,
    UserCreated, UserDeleted, UserUpdated,
};

pub use subscription::{
    CatalogWorkflow, RunOutcome, Tenant, WorkflowRun, WorkflowStatus, WorkflowSubscription,
};

pub use trigger::TriggerSpec;
