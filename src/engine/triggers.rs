// Recurring trigger API of the execution engine

//! # Trigger Engine
//!
//! The durable execution engine is an external collaborator. All this crate
//! needs from it is CRUD over recurring triggers keyed by a deterministic id,
//! which is what [`TriggerEngine`] captures.
//!
//! Adapters:
//! - [`InMemoryTriggerEngine`]: records calls, supports failure injection
//! - [`crate::engine::local_scheduler::LocalTriggerEngine`]: runs workflows in-process
//! - [`crate::engine::temporal::TemporalHttpEngine`]: schedule API of a Temporal server

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::models::TriggerSpec;
use crate::{KainosError, Result};

/// Workflow entry point the lifecycle manager binds triggers to
pub const DEFAULT_ENTRYPOINT: &str = "ExecuteAgentWorkflow";

/// Task queue workers listen on
pub const DEFAULT_TASK_QUEUE: &str = "default";

/// What a trigger runs when it fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerAction {
    /// Registered workflow entry point
    pub workflow_type: String,
    pub task_queue: String,
    /// Positional arguments handed to the entry point
    pub args: Vec<serde_json::Value>,
    /// Attempts per fired run, including the first
    pub max_attempts: u32,
}

impl TriggerAction {
    pub fn new(workflow_type: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            args,
            max_attempts: 3,
        }
    }

    pub fn on_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }
}

/// A registered trigger as reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerHandle {
    pub id: String,
    pub spec: TriggerSpec,
    pub action: TriggerAction,
    pub created_at: DateTime<Utc>,
}

/// Recurring-trigger CRUD exposed by an execution engine
///
/// `create_trigger` must fail if the id is taken; callers that want replace
/// semantics delete first. `delete_trigger` returns `false` when nothing was
/// registered under the id, which is not an error.
#[async_trait::async_trait]
pub trait TriggerEngine: Send + Sync {
    async fn create_trigger(
        &self,
        id: &str,
        spec: &TriggerSpec,
        action: &TriggerAction,
    ) -> Result<TriggerHandle>;

    async fn get_trigger(&self, id: &str) -> Result<Option<TriggerHandle>>;

    async fn delete_trigger(&self, id: &str) -> Result<bool>;
}

/// One call seen by [`InMemoryTriggerEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Create(String),
    Get(String),
    Delete(String),
}

/// Trigger engine kept in a map, for tests and single-process development
#[derive(Default)]
pub struct InMemoryTriggerEngine {
    triggers: DashMap<String, TriggerHandle>,
    calls: Mutex<Vec<EngineCall>>,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryTriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every create call fail until reset
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Delay every call, for exercising caller timeouts
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn create_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::Create(_)))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.triggers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Register a trigger directly, bypassing the call log (drift setup in tests)
    pub fn insert(&self, handle: TriggerHandle) {
        self.triggers.insert(handle.id.clone(), handle);
    }

    /// Drop a trigger directly, bypassing the call log
    pub fn remove(&self, id: &str) {
        self.triggers.remove(id);
    }

    async fn record(&self, call: EngineCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl TriggerEngine for InMemoryTriggerEngine {
    async fn create_trigger(
        &self,
        id: &str,
        spec: &TriggerSpec,
        action: &TriggerAction,
    ) -> Result<TriggerHandle> {
        self.record(EngineCall::Create(id.to_string())).await;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(KainosError::Engine(format!("create of '{}' rejected", id)));
        }
        if self.triggers.contains_key(id) {
            return Err(KainosError::Engine(format!("trigger '{}' already exists", id)));
        }
        let handle = TriggerHandle {
            id: id.to_string(),
            spec: spec.clone(),
            action: action.clone(),
            created_at: Utc::now(),
        };
        self.triggers.insert(id.to_string(), handle.clone());
        Ok(handle)
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<TriggerHandle>> {
        self.record(EngineCall::Get(id.to_string())).await;
        Ok(self.triggers.get(id).map(|h| h.value().clone()))
    }

    async fn delete_trigger(&self, id: &str) -> Result<bool> {
        self.record(EngineCall::Delete(id.to_string())).await;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(KainosError::Engine(format!("delete of '{}' rejected", id)));
        }
        Ok(self.triggers.remove(id).is_some())
    }
}
