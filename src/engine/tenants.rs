// Tenant onboarding and offboarding driven by identity-provider events

//! # Tenant Service
//!
//! Turns identity-provider user events into tenant records:
//!
//! - **created**: store the tenant, subscribe it to every catalog workflow
//!   (all OFF), then emit `user.created` and a welcome `email.send`. If any
//!   subscription cannot be created the error is returned and nothing is
//!   emitted; the identity provider's redelivery then resumes onboarding for
//!   the existing tenant and only creates the missing subscriptions.
//! - **updated**: refresh email and names, emit `user.updated`
//! - **deleted**: switch every subscription OFF (removing its trigger),
//!   soft-delete the tenant, emit `user.deleted`
//!
//! Store writes happen before events are emitted. A failed emit is logged
//! and does not undo the store change.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::lifecycle::TriggerLifecycleManager;
use super::storage::SubscriptionStore;
use crate::bus::EventBus;
use crate::models::{
    EmailRequested, EventData, Tenant, UserCreated, UserDeleted, UserUpdated, WorkflowSubscription,
};
use crate::{KainosError, Result};

/// Identity-provider view of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityUser {
    pub external_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl IdentityUser {
    fn tenant(&self) -> Tenant {
        Tenant::new(self.external_id.clone(), self.email.clone())
            .with_names(self.first_name.clone(), self.last_name.clone())
    }
}

/// Result of onboarding a user
#[derive(Debug, Clone)]
pub struct Onboarded {
    pub tenant: Tenant,
    pub subscriptions: Vec<WorkflowSubscription>,
}

pub struct TenantService {
    store: Arc<dyn SubscriptionStore>,
    lifecycle: Arc<TriggerLifecycleManager>,
    bus: EventBus,
}

impl TenantService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        lifecycle: Arc<TriggerLifecycleManager>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            lifecycle,
            bus,
        }
    }

    pub async fn user_created(&self, user: &IdentityUser) -> Result<Onboarded> {
        if user.email.trim().is_empty() {
            return Err(KainosError::InvalidInput(format!(
                "user {} has no email address",
                user.external_id
            )));
        }

        let (tenant, resumed) = match self.store.create_tenant(user.tenant()).await {
            Ok(tenant) => {
                info!("👤 Tenant {} created for {}", tenant.id, tenant.external_id);
                (tenant, false)
            }
            Err(KainosError::Conflict(msg)) => {
                match self.store.get_tenant_by_external_id(&user.external_id).await? {
                    Some(tenant) => (tenant, true),
                    None => return Err(KainosError::Conflict(msg)),
                }
            }
            Err(e) => return Err(e),
        };

        let mut subscriptions = self.store.list_subscriptions_for_tenant(&tenant.id).await?;
        let catalog = self.store.list_catalog().await?;
        let missing: Vec<_> = catalog
            .iter()
            .filter(|w| !subscriptions.iter().any(|s| s.workflow_definition_id == w.id))
            .collect();

        if resumed && missing.is_empty() {
            return Err(KainosError::Conflict(format!(
                "user {} is already onboarded",
                user.external_id
            )));
        }

        let pending = missing.iter().map(|workflow| {
            let mut sub = WorkflowSubscription::new(tenant.id, workflow.id.clone());
            sub.schedule_description = workflow.default_schedule.clone();
            self.store.create_subscription(sub)
        });

        let mut first_error = None;
        let mut raced = false;
        for (workflow, outcome) in missing.iter().zip(join_all(pending).await) {
            match outcome {
                Ok(sub) => subscriptions.push(sub),
                // A concurrent delivery created it first
                Err(KainosError::Conflict(_)) => raced = true,
                Err(e) => {
                    error!(
                        "❌ Failed to subscribe tenant {} to {}: {}",
                        tenant.id, workflow.id, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if raced {
            subscriptions = self.store.list_subscriptions_for_tenant(&tenant.id).await?;
        }
        info!(
            "📋 Tenant {} subscribed to {} catalog workflows ({} new)",
            tenant.id,
            subscriptions.len(),
            missing.len()
        );

        let created = UserCreated {
            user_id: tenant.external_id.clone(),
            email: tenant.email.clone(),
            name: tenant.display_name(),
            first_name: tenant.first_name.clone().unwrap_or_default(),
            last_name: tenant.last_name.clone().unwrap_or_default(),
        };
        self.emit_logged(&created).await;
        self.emit_logged(&EmailRequested::welcome(
            tenant.email.clone(),
            tenant.display_name(),
        ))
        .await;

        Ok(Onboarded {
            tenant,
            subscriptions,
        })
    }

    pub async fn user_updated(&self, user: &IdentityUser) -> Result<Tenant> {
        let mut tenant = self
            .store
            .get_tenant_by_external_id(&user.external_id)
            .await?
            .ok_or_else(|| KainosError::NotFound(format!("tenant for user {}", user.external_id)))?;

        if !user.email.trim().is_empty() {
            tenant.email = user.email.clone();
        }
        tenant.first_name = user.first_name.clone();
        tenant.last_name = user.last_name.clone();
        let tenant = self.store.update_tenant(tenant).await?;
        info!("👤 Tenant {} updated", tenant.id);

        self.emit_logged(&UserUpdated {
            user_id: tenant.external_id.clone(),
            email: tenant.email.clone(),
            name: tenant.display_name(),
            first_name: tenant.first_name.clone().unwrap_or_default(),
            last_name: tenant.last_name.clone().unwrap_or_default(),
        })
        .await;
        Ok(tenant)
    }

    /// Offboard a user; unknown users are treated as already gone
    pub async fn user_deleted(&self, external_id: &str) -> Result<Option<Tenant>> {
        let Some(tenant) = self.store.get_tenant_by_external_id(external_id).await? else {
            warn!("Delete for unknown user {}, nothing to do", external_id);
            return Ok(None);
        };

        for sub in self.store.list_subscriptions_for_tenant(&tenant.id).await? {
            if sub.is_on() || sub.external_trigger_id.is_some() {
                self.lifecycle.disable(&sub).await?;
            }
        }
        self.store.soft_delete_tenant(&tenant.id).await?;
        info!("🗑️ Tenant {} deleted", tenant.id);

        self.emit_logged(&UserDeleted {
            user_id: external_id.to_string(),
        })
        .await;
        self.store.get_tenant(&tenant.id).await
    }

    async fn emit_logged<T: EventData>(&self, payload: &T) {
        if let Err(e) = self.bus.emit(payload).await {
            error!("❌ Failed to publish {}: {}", T::EVENT_TYPE, e);
        }
    }
}
