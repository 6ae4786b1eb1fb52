// Storage abstraction for tenants, catalog and subscriptions
// This defines the interface the lifecycle manager and handlers persist through

//! # Storage Abstraction Layer
//!
//! The [`SubscriptionStore`] trait is the relational store as seen by the
//! rest of the crate. Two backends implement it:
//! - [`InMemoryStore`]: development and tests
//! - [`crate::engine::postgres::PgStore`]: production
//!
//! ## Optimistic Concurrency
//!
//! Subscriptions carry a `version`. [`SubscriptionStore::update_subscription`]
//! only writes when the stored version still equals the version the caller
//! read, and bumps it on success. Two concurrent toggles of the same
//! subscription therefore serialize: the loser gets [`KainosError::Conflict`]
//! and retries from a fresh read. No in-process lock is involved.
//!
//! ## Rust Learning Notes:
//!
//! This file demonstrates:
//! - Async traits with the async-trait crate
//! - Trait objects shared as `Arc<dyn SubscriptionStore>`
//! - `Result<Option<T>>` for "may fail, may be absent" lookups

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::models::{CatalogWorkflow, Tenant, WorkflowRun, WorkflowSubscription};
use crate::{KainosError, Result};

/// Persistence interface for tenants, the workflow catalog and subscriptions
///
/// ## Rust Learning Notes:
///
/// ### Trait Bounds
/// - `Send`: the store can move between threads
/// - `Sync`: the store can be shared between threads via references
/// Both are needed because handlers and background tasks share one store.
#[async_trait::async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a tenant; `Conflict` if a live tenant has the same external id
    async fn create_tenant(&self, tenant: Tenant) -> Result<Tenant>;

    async fn get_tenant(&self, id: &Uuid) -> Result<Option<Tenant>>;

    /// Look up a live (not soft-deleted) tenant by identity-provider id
    async fn get_tenant_by_external_id(&self, external_id: &str) -> Result<Option<Tenant>>;

    async fn update_tenant(&self, tenant: Tenant) -> Result<Tenant>;

    /// Mark a tenant deleted; the row stays
    async fn soft_delete_tenant(&self, id: &Uuid) -> Result<()>;

    async fn list_catalog(&self) -> Result<Vec<CatalogWorkflow>>;

    async fn upsert_catalog_workflow(&self, workflow: CatalogWorkflow) -> Result<CatalogWorkflow>;

    /// Insert a subscription; `Conflict` if the tenant already has this workflow
    async fn create_subscription(&self, sub: WorkflowSubscription) -> Result<WorkflowSubscription>;

    async fn get_subscription(&self, id: &Uuid) -> Result<Option<WorkflowSubscription>>;

    async fn list_subscriptions_for_tenant(&self, tenant_id: &Uuid) -> Result<Vec<WorkflowSubscription>>;

    async fn list_subscriptions(&self) -> Result<Vec<WorkflowSubscription>>;

    /// Compare-and-swap write of a subscription
    ///
    /// Succeeds only if the stored version equals `expected_version`. The
    /// returned record carries the bumped version.
    ///
    /// ## Errors
    /// - `NotFound` if the subscription does not exist
    /// - `Conflict` if another writer got there first
    async fn update_subscription(
        &self,
        sub: WorkflowSubscription,
        expected_version: i64,
    ) -> Result<WorkflowSubscription>;

    async fn record_run(&self, run: WorkflowRun) -> Result<WorkflowRun>;

    async fn list_runs(&self, subscription_id: &Uuid) -> Result<Vec<WorkflowRun>>;
}

/// In-memory store for development and testing
///
/// ## Limitations
///
/// - **Not persistent**: data is lost when the process restarts
/// - **Not distributed**: one process only
///
/// `fail_next_update` makes the next subscription write fail, which is how
/// tests exercise the lifecycle manager's compensation path.
/// `fail_next_subscription_create` does the same for inserts.
#[derive(Default)]
pub struct InMemoryStore {
    tenants: RwLock<HashMap<Uuid, Tenant>>,
    catalog: RwLock<Vec<CatalogWorkflow>>,
    subscriptions: RwLock<HashMap<Uuid, WorkflowSubscription>>,
    runs: RwLock<Vec<WorkflowRun>>,
    fail_next_update: AtomicBool,
    fail_next_create: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a catalog
    pub fn with_catalog(catalog: Vec<CatalogWorkflow>) -> Self {
        let store = Self::default();
        *write(&store.catalog) = catalog;
        store
    }

    pub fn fail_next_update(&self) {
        self.fail_next_update.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_subscription_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn create_tenant(&self, tenant: Tenant) -> Result<Tenant> {
        let mut tenants = write(&self.tenants);
        let duplicate = tenants
            .values()
            .any(|t| t.external_id == tenant.external_id && !t.is_deleted());
        if duplicate {
            return Err(KainosError::Conflict(format!(
                "tenant with external id '{}' already exists",
                tenant.external_id
            )));
        }
        tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn get_tenant(&self, id: &Uuid) -> Result<Option<Tenant>> {
        Ok(read(&self.tenants).get(id).cloned())
    }

    async fn get_tenant_by_external_id(&self, external_id: &str) -> Result<Option<Tenant>> {
        Ok(read(&self.tenants)
            .values()
            .find(|t| t.external_id == external_id && !t.is_deleted())
            .cloned())
    }

    async fn update_tenant(&self, mut tenant: Tenant) -> Result<Tenant> {
        let mut tenants = write(&self.tenants);
        if !tenants.contains_key(&tenant.id) {
            return Err(KainosError::NotFound(format!("tenant {}", tenant.id)));
        }
        tenant.updated_at = Utc::now();
        tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn soft_delete_tenant(&self, id: &Uuid) -> Result<()> {
        let mut tenants = write(&self.tenants);
        let tenant = tenants
            .get_mut(id)
            .ok_or_else(|| KainosError::NotFound(format!("tenant {}", id)))?;
        let now = Utc::now();
        tenant.deleted_at = Some(now);
        tenant.updated_at = now;
        Ok(())
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogWorkflow>> {
        Ok(read(&self.catalog).clone())
    }

    async fn upsert_catalog_workflow(&self, workflow: CatalogWorkflow) -> Result<CatalogWorkflow> {
        let mut catalog = write(&self.catalog);
        match catalog.iter_mut().find(|w| w.id == workflow.id) {
            Some(existing) => *existing = workflow.clone(),
            None => catalog.push(workflow.clone()),
        }
        Ok(workflow)
    }

    async fn create_subscription(&self, sub: WorkflowSubscription) -> Result<WorkflowSubscription> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(KainosError::Storage(anyhow::anyhow!(
                "injected insert failure for subscription {}",
                sub.id
            )));
        }
        let mut subs = write(&self.subscriptions);
        let duplicate = subs.values().any(|s| {
            s.tenant_id == sub.tenant_id && s.workflow_definition_id == sub.workflow_definition_id
        });
        if duplicate {
            return Err(KainosError::Conflict(format!(
                "tenant {} is already subscribed to '{}'",
                sub.tenant_id, sub.workflow_definition_id
            )));
        }
        subs.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn get_subscription(&self, id: &Uuid) -> Result<Option<WorkflowSubscription>> {
        Ok(read(&self.subscriptions).get(id).cloned())
    }

    async fn list_subscriptions_for_tenant(&self, tenant_id: &Uuid) -> Result<Vec<WorkflowSubscription>> {
        let mut subs: Vec<WorkflowSubscription> = read(&self.subscriptions)
            .values()
            .filter(|s| s.tenant_id == *tenant_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.workflow_definition_id.cmp(&b.workflow_definition_id));
        Ok(subs)
    }

    async fn list_subscriptions(&self) -> Result<Vec<WorkflowSubscription>> {
        Ok(read(&self.subscriptions).values().cloned().collect())
    }

    async fn update_subscription(
        &self,
        mut sub: WorkflowSubscription,
        expected_version: i64,
    ) -> Result<WorkflowSubscription> {
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(KainosError::Storage(anyhow::anyhow!(
                "injected write failure for subscription {}",
                sub.id
            )));
        }

        let mut subs = write(&self.subscriptions);
        let stored = subs
            .get(&sub.id)
            .ok_or_else(|| KainosError::NotFound(format!("subscription {}", sub.id)))?;
        if stored.version != expected_version {
            return Err(KainosError::Conflict(format!(
                "subscription {} is at version {}, expected {}",
                sub.id, stored.version, expected_version
            )));
        }
        sub.version = expected_version + 1;
        sub.updated_at = Utc::now();
        subs.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn record_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        write(&self.runs).push(run.clone());
        Ok(run)
    }

    async fn list_runs(&self, subscription_id: &Uuid) -> Result<Vec<WorkflowRun>> {
        Ok(read(&self.runs)
            .iter()
            .filter(|r| r.subscription_id == *subscription_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunOutcome, WorkflowStatus};

    #[tokio::test]
    async fn test_update_subscription_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let sub = store
            .create_subscription(WorkflowSubscription::new(Uuid::new_v4(), "digest"))
            .await
            .unwrap();

        let mut on = sub.clone();
        on.status = WorkflowStatus::On;
        on.external_trigger_id = Some(sub.trigger_id());
        let saved = store.update_subscription(on.clone(), 0).await.unwrap();
        assert_eq!(saved.version, 1);

        // A writer still holding version 0 loses
        let err = store.update_subscription(on, 0).await.unwrap_err();
        assert!(matches!(err, KainosError::Conflict(_)));

        let stored = store.get_subscription(&sub.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, WorkflowStatus::On);
    }

    #[tokio::test]
    async fn test_update_missing_subscription() {
        let store = InMemoryStore::new();
        let sub = WorkflowSubscription::new(Uuid::new_v4(), "digest");
        let err = store.update_subscription(sub, 0).await.unwrap_err();
        assert!(matches!(err, KainosError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let store = InMemoryStore::new();
        let tenant_id = Uuid::new_v4();
        store
            .create_subscription(WorkflowSubscription::new(tenant_id, "digest"))
            .await
            .unwrap();
        let err = store
            .create_subscription(WorkflowSubscription::new(tenant_id, "digest"))
            .await
            .unwrap_err();
        assert!(matches!(err, KainosError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_soft_deleted_tenant_is_hidden_from_lookup() {
        let store = InMemoryStore::new();
        let tenant = store
            .create_tenant(Tenant::new("user_1", "a@example.com"))
            .await
            .unwrap();
        assert!(store.get_tenant_by_external_id("user_1").await.unwrap().is_some());

        store.soft_delete_tenant(&tenant.id).await.unwrap();
        assert!(store.get_tenant_by_external_id("user_1").await.unwrap().is_none());
        // The row itself survives
        assert!(store.get_tenant(&tenant.id).await.unwrap().unwrap().is_deleted());

        // The external id can be onboarded again
        assert!(store.create_tenant(Tenant::new("user_1", "a@example.com")).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_write_failure_is_one_shot() {
        let store = InMemoryStore::new();
        let sub = store
            .create_subscription(WorkflowSubscription::new(Uuid::new_v4(), "digest"))
            .await
            .unwrap();
        store.fail_next_update();
        assert!(store.update_subscription(sub.clone(), 0).await.is_err());
        assert!(store.update_subscription(sub, 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_runs_are_filtered_by_subscription() {
        let store = InMemoryStore::new();
        let a = Uuid::new_v4();
        store.record_run(WorkflowRun::new(a, RunOutcome::Succeeded, None)).await.unwrap();
        store.record_run(WorkflowRun::new(Uuid::new_v4(), RunOutcome::Failed, None)).await.unwrap();
        let runs = store.list_runs(&a).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
    }
}
