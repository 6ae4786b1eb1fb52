// In-process trigger engine and workflow registry

//! # Local Trigger Engine
//!
//! [`LocalTriggerEngine`] runs triggers inside the current process. It is used
//! for development and single-node deployments where no external durable
//! engine is available.
//!
//! - [`WorkflowRegistry`] maps entry point and activity names to async
//!   functions. The server registers them once at startup.
//! - Every trigger gets its own tokio task that wakes on minute boundaries and
//!   runs the bound entry point when [`TriggerSpec::matches`] the current
//!   minute, read in the spec's time zone.
//! - A failed run is retried up to the action's `max_attempts`, with a linear
//!   wait between attempts.
//! - Fired runs live in a `JoinSet`. After [`LocalTriggerEngine::shutdown`]
//!   no new runs start, and [`LocalTriggerEngine::drain`] waits for the ones
//!   still in flight.
//!
//! Triggers do not survive a restart; the server re-creates them with
//! `reconcile_all` on boot.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::triggers::{TriggerAction, TriggerEngine, TriggerHandle};
use crate::models::TriggerSpec;
use crate::{KainosError, Result};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Registered workflow entry point
pub type WorkflowFn = Arc<dyn Fn(WorkflowContext, Vec<Value>) -> BoxFuture<Result<Value>> + Send + Sync>;

/// Registered activity
pub type ActivityFn = Arc<dyn Fn(Value) -> BoxFuture<Result<Value>> + Send + Sync>;

/// Named workflows and activities the local engine can run
///
/// ## Rust Learning Notes:
///
/// ### Type-erased async functions
/// Each registered closure returns its own anonymous future type. Boxing the
/// future (`Pin<Box<dyn Future>>`) gives all of them one common type so they
/// can live in the same map.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: DashMap<String, WorkflowFn>,
    activities: DashMap<String, ActivityFn>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_workflow<F, Fut>(&self, name: impl Into<String>, workflow: F)
    where
        F: Fn(WorkflowContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        info!("📋 Registered workflow {}", name);
        let boxed: WorkflowFn = Arc::new(
            move |ctx: WorkflowContext, args: Vec<Value>| -> BoxFuture<Result<Value>> {
                Box::pin(workflow(ctx, args))
            },
        );
        self.workflows.insert(name, boxed);
    }

    pub fn register_activity<F, Fut>(&self, name: impl Into<String>, activity: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = name.into();
        info!("📋 Registered activity {}", name);
        let boxed: ActivityFn =
            Arc::new(move |input: Value| -> BoxFuture<Result<Value>> { Box::pin(activity(input)) });
        self.activities.insert(name, boxed);
    }

    pub fn has_workflow(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.workflows.iter().map(|e| e.key().clone()).collect()
    }

    fn workflow(&self, name: &str) -> Option<WorkflowFn> {
        self.workflows.get(name).map(|w| w.value().clone())
    }

    fn activity(&self, name: &str) -> Option<ActivityFn> {
        self.activities.get(name).map(|a| a.value().clone())
    }
}

/// Handed to a workflow run so it can call activities
#[derive(Clone)]
pub struct WorkflowContext {
    registry: Arc<WorkflowRegistry>,
    pub trigger_id: String,
    pub attempt: u32,
}

impl WorkflowContext {
    pub async fn execute_activity(&self, name: &str, input: Value) -> Result<Value> {
        let activity = self
            .registry
            .activity(name)
            .ok_or_else(|| KainosError::Engine(format!("activity '{}' is not registered", name)))?;
        debug!("▶️ {} running activity {}", self.trigger_id, name);
        activity(input).await
    }
}

struct LocalTrigger {
    handle: TriggerHandle,
    cancel: CancellationToken,
}

type RunSet = Arc<Mutex<JoinSet<()>>>;

/// Trigger engine that runs workflows on tokio tasks
pub struct LocalTriggerEngine {
    registry: Arc<WorkflowRegistry>,
    triggers: Arc<DashMap<String, LocalTrigger>>,
    runs: RunSet,
    shutdown: CancellationToken,
    retry_wait: Duration,
}

impl LocalTriggerEngine {
    pub fn new(registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            registry,
            triggers: Arc::new(DashMap::new()),
            runs: Arc::new(Mutex::new(JoinSet::new())),
            shutdown: CancellationToken::new(),
            retry_wait: Duration::from_secs(1),
        }
    }

    /// Base wait between failed run attempts (multiplied by the attempt number)
    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Run a registered trigger's action right away
    pub async fn fire_now(&self, id: &str) -> Result<Value> {
        let action = self
            .triggers
            .get(id)
            .map(|t| t.handle.action.clone())
            .ok_or_else(|| KainosError::NotFound(format!("trigger '{}'", id)))?;
        run_with_retries(self.registry.clone(), id.to_string(), action, self.retry_wait).await
    }

    /// Fire every trigger whose spec matches `now`; returns the fired ids
    pub fn run_due(&self, now: DateTime<Utc>) -> Vec<String> {
        if self.shutdown.is_cancelled() {
            return Vec::new();
        }
        let due: Vec<(String, TriggerAction)> = self
            .triggers
            .iter()
            .filter(|t| t.handle.spec.matches(now))
            .map(|t| (t.key().clone(), t.handle.action.clone()))
            .collect();

        for (id, action) in &due {
            spawn_run(
                &self.runs,
                self.registry.clone(),
                id.clone(),
                action.clone(),
                self.retry_wait,
            );
        }
        due.into_iter().map(|(id, _)| id).collect()
    }

    /// Runs started by the scheduler that have not finished yet
    pub fn in_flight(&self) -> usize {
        let mut runs = lock_runs(&self.runs);
        while runs.try_join_next().is_some() {}
        runs.len()
    }

    /// Registered trigger ids and the entry point each one runs
    pub fn registered(&self) -> HashMap<String, String> {
        self.triggers
            .iter()
            .map(|t| (t.key().clone(), t.handle.action.workflow_type.clone()))
            .collect()
    }

    /// Stop every trigger task; runs already started keep going
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.triggers.clear();
    }

    /// Wait up to `grace` for in-flight runs, aborting whatever is left
    ///
    /// Returns how many runs finished within the grace period.
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut runs = std::mem::take(&mut *lock_runs(&self.runs));
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        let mut finished = 0;
        loop {
            tokio::select! {
                next = runs.join_next() => match next {
                    Some(_) => finished += 1,
                    None => break,
                },
                _ = &mut deadline => {
                    warn!("⏱️ Aborting {} runs still in flight", runs.len());
                    runs.shutdown().await;
                    break;
                }
            }
        }
        finished
    }

    fn spawn_ticker(&self, id: String, spec: TriggerSpec, action: TriggerAction, cancel: CancellationToken) {
        let registry = self.registry.clone();
        let runs = self.runs.clone();
        let wait = self.retry_wait;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Trigger {} stopped", id);
                        break;
                    }
                    _ = tokio::time::sleep(until_next_minute(Utc::now())) => {}
                }
                if !cancel.is_cancelled() && spec.matches(Utc::now()) {
                    spawn_run(&runs, registry.clone(), id.clone(), action.clone(), wait);
                }
            }
        });
    }
}

impl Drop for LocalTriggerEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock_runs(runs: &Mutex<JoinSet<()>>) -> std::sync::MutexGuard<'_, JoinSet<()>> {
    runs.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_run(
    runs: &Mutex<JoinSet<()>>,
    registry: Arc<WorkflowRegistry>,
    trigger_id: String,
    action: TriggerAction,
    retry_wait: Duration,
) {
    let mut runs = lock_runs(runs);
    // Reap finished runs so the set only holds live ones
    while runs.try_join_next().is_some() {}
    runs.spawn(async move {
        // Failures are logged inside
        let _ = run_with_retries(registry, trigger_id, action, retry_wait).await;
    });
}

/// Time left until the next minute starts
fn until_next_minute(now: DateTime<Utc>) -> Duration {
    let nanos = u64::from(now.nanosecond() % 1_000_000_000);
    let into_minute = Duration::from_secs(u64::from(now.second())) + Duration::from_nanos(nanos);
    Duration::from_secs(60)
        .saturating_sub(into_minute)
        .max(Duration::from_millis(1))
}

async fn run_with_retries(
    registry: Arc<WorkflowRegistry>,
    trigger_id: String,
    action: TriggerAction,
    retry_wait: Duration,
) -> Result<Value> {
    let workflow = registry.workflow(&action.workflow_type).ok_or_else(|| {
        KainosError::Engine(format!("workflow '{}' is not registered", action.workflow_type))
    })?;
    let max_attempts = action.max_attempts.max(1);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let ctx = WorkflowContext {
            registry: registry.clone(),
            trigger_id: trigger_id.clone(),
            attempt,
        };
        match workflow(ctx, action.args.clone()).await {
            Ok(output) => {
                info!("✅ {} run of {} finished", trigger_id, action.workflow_type);
                return Ok(output);
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    "🔄 {} attempt {}/{} failed: {}",
                    trigger_id, attempt, max_attempts, e
                );
                tokio::time::sleep(retry_wait * attempt).await;
            }
            Err(e) => {
                error!(
                    "❌ {} failed after {} attempts: {}",
                    trigger_id, attempt, e
                );
                return Err(e);
            }
        }
    }
}

#[async_trait::async_trait]
impl TriggerEngine for LocalTriggerEngine {
    async fn create_trigger(
        &self,
        id: &str,
        spec: &TriggerSpec,
        action: &TriggerAction,
    ) -> Result<TriggerHandle> {
        if !self.registry.has_workflow(&action.workflow_type) {
            return Err(KainosError::Engine(format!(
                "workflow '{}' is not registered",
                action.workflow_type
            )));
        }
        spec.zone()?;
        if self.triggers.contains_key(id) {
            return Err(KainosError::Engine(format!("trigger '{}' already exists", id)));
        }

        let handle = TriggerHandle {
            id: id.to_string(),
            spec: spec.clone(),
            action: action.clone(),
            created_at: Utc::now(),
        };
        let cancel = self.shutdown.child_token();
        self.triggers.insert(
            id.to_string(),
            LocalTrigger {
                handle: handle.clone(),
                cancel: cancel.clone(),
            },
        );
        self.spawn_ticker(id.to_string(), spec.clone(), action.clone(), cancel);
        Ok(handle)
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<TriggerHandle>> {
        Ok(self.triggers.get(id).map(|t| t.handle.clone()))
    }

    async fn delete_trigger(&self, id: &str) -> Result<bool> {
        match self.triggers.remove(id) {
            Some((_, trigger)) => {
                trigger.cancel.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry_with_flaky_workflow(fail_times: u32) -> (Arc<WorkflowRegistry>, Arc<AtomicU32>) {
        let registry = Arc::new(WorkflowRegistry::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        registry.register_activity("echo", |input| async move { Ok(input) });
        registry.register_workflow("Flaky", move |ctx, args| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_times {
                    return Err(KainosError::Upstream {
                        status: 502,
                        body: "bad gateway".into(),
                    });
                }
                ctx.execute_activity("echo", Value::Array(args)).await
            }
        });
        (registry, calls)
    }

    #[test]
    fn test_until_next_minute() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 45).unwrap();
        assert_eq!(until_next_minute(t), Duration::from_secs(15));
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        assert_eq!(until_next_minute(t), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_runs_are_retried() {
        let (registry, calls) = registry_with_flaky_workflow(2);
        let engine = LocalTriggerEngine::new(registry).with_retry_wait(Duration::from_millis(10));
        let action = TriggerAction::new("Flaky", vec![Value::from("sub-1")]);
        engine
            .create_trigger("workflow-1", &TriggerSpec::at(9, 0), &action)
            .await
            .unwrap();

        let output = engine.fire_now("workflow-1").await.unwrap();
        assert_eq!(output, Value::Array(vec![Value::from("sub-1")]));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_attempts() {
        let (registry, calls) = registry_with_flaky_workflow(10);
        let engine = LocalTriggerEngine::new(registry).with_retry_wait(Duration::from_millis(10));
        let action = TriggerAction::new("Flaky", vec![]);
        engine
            .create_trigger("workflow-1", &TriggerSpec::default(), &action)
            .await
            .unwrap();

        assert!(engine.fire_now("workflow-1").await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregistered_workflow_is_rejected() {
        let engine = LocalTriggerEngine::new(Arc::new(WorkflowRegistry::new()));
        let action = TriggerAction::new("Missing", vec![]);
        let err = engine
            .create_trigger("workflow-1", &TriggerSpec::default(), &action)
            .await
            .unwrap_err();
        assert!(matches!(err, KainosError::Engine(_)));
    }

    #[tokio::test]
    async fn test_run_due_only_fires_matching_triggers() {
        let (registry, _calls) = registry_with_flaky_workflow(0);
        let engine = LocalTriggerEngine::new(registry);
        let action = TriggerAction::new("Flaky", vec![]);
        engine
            .create_trigger("workflow-morning", &TriggerSpec::at(9, 0), &action)
            .await
            .unwrap();
        engine
            .create_trigger("workflow-evening", &TriggerSpec::at(17, 0), &action)
            .await
            .unwrap();

        let nine = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        assert_eq!(engine.run_due(nine), vec!["workflow-morning".to_string()]);
    }

    #[tokio::test]
    async fn test_run_due_reads_zoned_specs_in_their_zone() {
        let (registry, _calls) = registry_with_flaky_workflow(0);
        let engine = LocalTriggerEngine::new(registry);
        let action = TriggerAction::new("Flaky", vec![]);
        let open = TriggerSpec::at(9, 30).on_weekdays(1..=5).in_zone("America/New_York");
        engine
            .create_trigger("workflow-open", &open, &action)
            .await
            .unwrap();

        let utc_0930 = Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap();
        assert!(engine.run_due(utc_0930).is_empty());
        let ny_0930 = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        assert_eq!(engine.run_due(ny_0930), vec!["workflow-open".to_string()]);

        let bad = TriggerSpec::at(9, 0).in_zone("Nowhere/Special");
        let err = engine
            .create_trigger("workflow-bad", &bad, &action)
            .await
            .unwrap_err();
        assert!(matches!(err, KainosError::InvalidInput(_)));
    }

    fn registry_with_slow_workflow(takes: Duration) -> (Arc<WorkflowRegistry>, Arc<AtomicU32>) {
        let registry = Arc::new(WorkflowRegistry::new());
        let finished = Arc::new(AtomicU32::new(0));
        let counter = finished.clone();
        registry.register_workflow("Slow", move |_ctx, _args| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(takes).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        (registry, finished)
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_in_flight_runs() {
        let (registry, finished) = registry_with_slow_workflow(Duration::from_secs(5));
        let engine = LocalTriggerEngine::new(registry);
        engine
            .create_trigger("workflow-1", &TriggerSpec::default(), &TriggerAction::new("Slow", vec![]))
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        assert_eq!(engine.run_due(now).len(), 1);
        assert_eq!(engine.in_flight(), 1);

        engine.shutdown();
        assert!(engine.run_due(now).is_empty());
        assert_eq!(engine.drain(Duration::from_secs(30)).await, 1);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_runs_past_grace() {
        let (registry, finished) = registry_with_slow_workflow(Duration::from_secs(60));
        let engine = LocalTriggerEngine::new(registry);
        engine
            .create_trigger("workflow-1", &TriggerSpec::default(), &TriggerAction::new("Slow", vec![]))
            .await
            .unwrap();
        engine.run_due(Utc::now());

        engine.shutdown();
        assert_eq!(engine.drain(Duration::from_secs(1)).await, 0);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_stops_trigger() {
        let (registry, _calls) = registry_with_flaky_workflow(0);
        let engine = LocalTriggerEngine::new(registry);
        let action = TriggerAction::new("Flaky", vec![]);
        engine
            .create_trigger("workflow-1", &TriggerSpec::default(), &action)
            .await
            .unwrap();
        assert_eq!(engine.registered().len(), 1);

        assert!(engine.delete_trigger("workflow-1").await.unwrap());
        assert!(!engine.delete_trigger("workflow-1").await.unwrap());
        assert!(engine.get_trigger("workflow-1").await.unwrap().is_none());
        assert!(matches!(
            engine.fire_now("workflow-1").await,
            Err(KainosError::NotFound(_))
        ));
    }
}
