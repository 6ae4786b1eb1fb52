// Recurring trigger lifecycle management
// Keeps a subscription's ON/OFF state mirrored by the execution engine

//! # Trigger Lifecycle Manager
//!
//! A [`WorkflowSubscription`] that is ON must have exactly one recurring
//! trigger registered under `"workflow-" + subscription.id`; one that is OFF
//! must have none. [`TriggerLifecycleManager`] is the only component that
//! moves a subscription between the two.
//!
//! ## Ordering
//!
//! The engine call always happens first and the database write second. If the
//! engine call fails, nothing is written and the caller gets the engine error
//! as-is. The database never claims a trigger the engine does not have.
//!
//! If the write fails, the engine is put back in line with whatever record is
//! stored: a stored ON record gets its trigger re-created from its own
//! schedule, and a trigger nobody claims is deleted again. A failed toggle or
//! schedule change therefore leaves both sides where they were.
//!
//! [`TriggerLifecycleManager::detect_drift`] also compares the registered
//! calendar with the stored schedule, so a mismatch that slipped through
//! (for example when the restore itself failed) is repaired by reconcile.
//!
//! ## Concurrency
//!
//! No locks. Writes are compare-and-swap on `version`; a concurrent toggle of
//! the same subscription surfaces as [`KainosError::Conflict`]. Callers
//! resolve it by re-reading and calling [`TriggerLifecycleManager::reconcile`].
//!
//! ## Rust Learning Notes:
//!
//! ### Bounded futures
//! `tokio::time::timeout` wraps any future and races it against a deadline.
//! When the deadline wins, the inner future is dropped, which cancels the
//! in-flight HTTP call or channel wait without any extra plumbing.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::schedule::translate;
use super::storage::SubscriptionStore;
use super::triggers::{
    TriggerAction, TriggerEngine, TriggerHandle, DEFAULT_ENTRYPOINT, DEFAULT_TASK_QUEUE,
};
use crate::models::{TriggerSpec, WorkflowStatus, WorkflowSubscription};
use crate::{KainosError, Result};

/// Settings for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Workflow entry point every trigger runs
    pub entrypoint: String,
    pub task_queue: String,
    /// Upper bound on each engine call
    pub call_timeout: Duration,
    /// Attempts per fired run, passed through to the engine
    pub run_attempts: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            call_timeout: Duration::from_secs(10),
            run_attempts: 3,
        }
    }
}

/// Mismatch between a subscription record and the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Drift {
    /// Record is ON but the engine has no trigger
    MissingTrigger,
    /// Record is OFF but a trigger is still registered
    OrphanTrigger,
    /// Record is ON and a trigger exists, but the record has no trigger id
    UnrecordedTrigger,
    /// Trigger exists but fires on a different calendar than the stored schedule
    ScheduleMismatch,
}

/// Outcome of [`TriggerLifecycleManager::reconcile_all`]
#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub total: usize,
    pub converged: usize,
    pub failed: Vec<ReconcileFailure>,
}

#[derive(Debug, Serialize)]
pub struct ReconcileFailure {
    pub subscription_id: Uuid,
    pub error: String,
}

/// Mirrors subscription status into the execution engine
pub struct TriggerLifecycleManager {
    engine: Arc<dyn TriggerEngine>,
    store: Arc<dyn SubscriptionStore>,
    config: LifecycleConfig,
}

impl TriggerLifecycleManager {
    pub fn new(
        engine: Arc<dyn TriggerEngine>,
        store: Arc<dyn SubscriptionStore>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SubscriptionStore> {
        &self.store
    }

    fn action_for(&self, sub: &WorkflowSubscription) -> TriggerAction {
        TriggerAction {
            workflow_type: self.config.entrypoint.clone(),
            task_queue: self.config.task_queue.clone(),
            args: vec![
                serde_json::Value::String(sub.id.to_string()),
                serde_json::Value::String(sub.workflow_definition_id.clone()),
            ],
            max_attempts: self.config.run_attempts,
        }
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(KainosError::Timeout {
                operation: operation.to_string(),
                after: self.config.call_timeout,
            }),
        }
    }

    /// Delete any trigger under the subscription's id, then create one for `spec`
    async fn install_trigger(
        &self,
        sub: &WorkflowSubscription,
        spec: &TriggerSpec,
    ) -> Result<TriggerHandle> {
        let trigger_id = sub.trigger_id();
        if self
            .bounded("delete trigger", self.engine.delete_trigger(&trigger_id))
            .await?
        {
            debug!("Replaced existing trigger {}", trigger_id);
        }
        self.bounded(
            "create trigger",
            self.engine
                .create_trigger(&trigger_id, spec, &self.action_for(sub)),
        )
        .await
    }

    /// Register (or replace) the trigger and mark the subscription ON
    pub async fn enable(
        &self,
        sub: &WorkflowSubscription,
        schedule: &str,
    ) -> Result<WorkflowSubscription> {
        let spec = translate(schedule)?;
        let handle = self.install_trigger(sub, &spec).await?;
        info!(
            "⏰ Trigger {} registered for subscription {} ({})",
            handle.id, sub.id, schedule
        );

        let mut desired = sub.clone();
        desired.status = WorkflowStatus::On;
        desired.external_trigger_id = Some(handle.id);
        desired.schedule_description = Some(schedule.to_string());

        match self.persist(sub, desired).await {
            Ok(saved) => Ok(saved),
            Err(e) => {
                self.realign_after_failed_write(sub, true).await;
                Err(e)
            }
        }
    }

    /// Remove the trigger and mark the subscription OFF
    pub async fn disable(&self, sub: &WorkflowSubscription) -> Result<WorkflowSubscription> {
        self.disable_with_schedule(sub, sub.schedule_description.clone())
            .await
    }

    async fn disable_with_schedule(
        &self,
        sub: &WorkflowSubscription,
        schedule: Option<String>,
    ) -> Result<WorkflowSubscription> {
        let trigger_id = sub.trigger_id();
        let existed = self
            .bounded("delete trigger", self.engine.delete_trigger(&trigger_id))
            .await?;
        if existed {
            info!("🛑 Trigger {} removed for subscription {}", trigger_id, sub.id);
        } else {
            debug!("Trigger {} was already absent", trigger_id);
        }

        let mut desired = sub.clone();
        desired.status = WorkflowStatus::Off;
        desired.external_trigger_id = None;
        desired.schedule_description = schedule;
        match self.persist(sub, desired).await {
            Ok(saved) => Ok(saved),
            Err(e) => {
                self.realign_after_failed_write(sub, false).await;
                Err(e)
            }
        }
    }

    /// Converge the engine to the record's current status
    pub async fn reconcile(&self, sub: &WorkflowSubscription) -> Result<WorkflowSubscription> {
        match sub.status {
            WorkflowStatus::On => {
                let schedule = self.schedule_for(sub).await?;
                self.enable(sub, &schedule).await
            }
            WorkflowStatus::Off => self.disable(sub).await,
        }
    }

    /// Load a subscription and switch it ON or OFF
    ///
    /// Turning ON without a stored schedule falls back to the catalog default.
    pub async fn set_status(&self, id: &Uuid, status: WorkflowStatus) -> Result<WorkflowSubscription> {
        let sub = self.load(id).await?;
        match status {
            WorkflowStatus::On => {
                let schedule = self.schedule_for(&sub).await?;
                self.enable(&sub, &schedule).await
            }
            WorkflowStatus::Off => self.disable(&sub).await,
        }
    }

    /// Store a new schedule and apply the requested status
    ///
    /// The schedule is validated even when the result is OFF.
    pub async fn update_schedule(
        &self,
        id: &Uuid,
        schedule: &str,
        status: WorkflowStatus,
    ) -> Result<WorkflowSubscription> {
        translate(schedule)?;
        let sub = self.load(id).await?;
        match status {
            WorkflowStatus::On => self.enable(&sub, schedule).await,
            WorkflowStatus::Off => {
                self.disable_with_schedule(&sub, Some(schedule.to_string()))
                    .await
            }
        }
    }

    /// Reconcile a subscription by id, re-reading it first
    pub async fn reconcile_by_id(&self, id: &Uuid) -> Result<WorkflowSubscription> {
        let sub = self.load(id).await?;
        self.reconcile(&sub).await
    }

    /// Compare a record with the engine without changing either
    pub async fn detect_drift(&self, sub: &WorkflowSubscription) -> Result<Option<Drift>> {
        let trigger = self
            .bounded("get trigger", self.engine.get_trigger(&sub.trigger_id()))
            .await?;
        let drift = match (sub.status, trigger, sub.external_trigger_id.is_some()) {
            (WorkflowStatus::On, None, _) => Some(Drift::MissingTrigger),
            (WorkflowStatus::On, Some(_), false) => Some(Drift::UnrecordedTrigger),
            (WorkflowStatus::On, Some(handle), true) => {
                let expected = translate(&self.schedule_for(sub).await?)?;
                (!handle.spec.same_calendar(&expected)).then_some(Drift::ScheduleMismatch)
            }
            (WorkflowStatus::Off, Some(_), _) => Some(Drift::OrphanTrigger),
            (WorkflowStatus::Off, None, _) => None,
        };
        Ok(drift)
    }

    /// Reconcile every subscription, collecting failures instead of stopping
    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let subs = self.store.list_subscriptions().await?;
        let mut report = ReconcileReport {
            total: subs.len(),
            ..Default::default()
        };

        for sub in subs {
            match self.detect_drift(&sub).await {
                Ok(Some(drift)) => warn!("⚠️ Subscription {} drifted: {:?}", sub.id, drift),
                Ok(None) => {}
                Err(e) => debug!("Drift check for {} failed: {}", sub.id, e),
            }
            match self.reconcile(&sub).await {
                Ok(_) => report.converged += 1,
                Err(e) => {
                    error!("❌ Failed to reconcile subscription {}: {}", sub.id, e);
                    report.failed.push(ReconcileFailure {
                        subscription_id: sub.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "🔁 Reconciled {}/{} subscriptions",
            report.converged, report.total
        );
        Ok(report)
    }

    async fn load(&self, id: &Uuid) -> Result<WorkflowSubscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| KainosError::NotFound(format!("subscription {}", id)))
    }

    async fn schedule_for(&self, sub: &WorkflowSubscription) -> Result<String> {
        if let Some(schedule) = &sub.schedule_description {
            return Ok(schedule.clone());
        }
        let catalog = self.store.list_catalog().await?;
        catalog
            .into_iter()
            .find(|w| w.id == sub.workflow_definition_id)
            .and_then(|w| w.default_schedule)
            .ok_or_else(|| {
                KainosError::InvalidInput(format!(
                    "subscription {} has no schedule to enable with",
                    sub.id
                ))
            })
    }

    /// Write `desired` unless the record already matches it
    ///
    /// A version conflict is not an error when the winning writer already left
    /// the record in the desired state.
    async fn persist(
        &self,
        current: &WorkflowSubscription,
        desired: WorkflowSubscription,
    ) -> Result<WorkflowSubscription> {
        if same_state(current, &desired) {
            debug!("Subscription {} already in desired state", current.id);
            return Ok(current.clone());
        }

        match self
            .store
            .update_subscription(desired.clone(), current.version)
            .await
        {
            Ok(saved) => Ok(saved),
            Err(KainosError::Conflict(msg)) => match self.store.get_subscription(&current.id).await? {
                Some(stored) if same_state(&stored, &desired) => Ok(stored),
                _ => Err(KainosError::Conflict(msg)),
            },
            Err(e) => Err(e),
        }
    }

    /// Make the engine match the stored record after a write of `attempted` failed
    ///
    /// `created` says whether this call registered a new trigger that may now
    /// be unclaimed.
    async fn realign_after_failed_write(&self, attempted: &WorkflowSubscription, created: bool) {
        let stored = match self.store.get_subscription(&attempted.id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(
                    "Could not re-read subscription {} after failed write: {}",
                    attempted.id, e
                );
                Some(attempted.clone())
            }
        };

        match stored {
            Some(stored) if stored.is_on() => {
                if let Err(e) = self.restore_trigger(&stored).await {
                    error!(
                        "❌ Trigger {} may not match subscription {}: {}",
                        stored.trigger_id(),
                        stored.id,
                        e
                    );
                }
            }
            _ if created => self.compensate(&attempted.trigger_id()).await,
            _ => {}
        }
    }

    /// Re-create the trigger from the stored record's own schedule
    async fn restore_trigger(&self, stored: &WorkflowSubscription) -> Result<()> {
        let schedule = self.schedule_for(stored).await?;
        let spec = translate(&schedule)?;
        self.install_trigger(stored, &spec).await?;
        warn!(
            "↩️ Restored trigger {} to stored schedule {}",
            stored.trigger_id(),
            schedule
        );
        Ok(())
    }

    async fn compensate(&self, trigger_id: &str) {
        match self
            .bounded("delete trigger", self.engine.delete_trigger(trigger_id))
            .await
        {
            Ok(_) => warn!("↩️ Removed trigger {} after failed write", trigger_id),
            Err(e) => error!(
                "❌ Trigger {} left registered after failed write: {}",
                trigger_id, e
            ),
        }
    }
}

fn same_state(a: &WorkflowSubscription, b: &WorkflowSubscription) -> bool {
    a.status == b.status
        && a.external_trigger_id == b.external_trigger_id
        && a.schedule_description == b.schedule_description
}
