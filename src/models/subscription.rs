// Tenant and subscription models

//! # Subscription Models
//!
//! - `Tenant`: a user onboarded from the identity provider
//! - `CatalogWorkflow`: a workflow every tenant gets subscribed to
//! - `WorkflowSubscription`: the ON/OFF binding between the two
//! - `WorkflowRun`: the recorded outcome of one triggered execution
//!
//! `WorkflowSubscription::external_trigger_id` is `Some` exactly when the
//! status is ON. The lifecycle manager is the only writer that flips status,
//! and every write is a compare-and-swap on `version`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::KainosError;

/// Desired state of a tenant's workflow subscription
///
/// Serialized as `"ON"` / `"OFF"` both on the HTTP surface and in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::On => "ON",
            WorkflowStatus::Off => "OFF",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = KainosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ON" => Ok(WorkflowStatus::On),
            "OFF" => Ok(WorkflowStatus::Off),
            other => Err(KainosError::InvalidInput(format!(
                "status must be ON or OFF, got '{}'",
                other
            ))),
        }
    }
}

/// A tenant, keyed internally by UUID and externally by the identity provider id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    /// User id assigned by the identity provider
    pub external_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(external_id: impl Into<String>, email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            email: email.into(),
            first_name: None,
            last_name: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_names(mut self, first: Option<String>, last: Option<String>) -> Self {
        self.first_name = first;
        self.last_name = last;
        self
    }

    /// "First Last", falling back to whichever half exists, then the email
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => format!("{} {}", f, l),
            (Some(f), None) => f.clone(),
            (None, Some(l)) => l.clone(),
            (None, None) => self.email.clone(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Entry in the workflow catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogWorkflow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Schedule used when a tenant turns the workflow on without picking one
    pub default_schedule: Option<String>,
}

/// Persisted binding of a tenant to a catalog workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSubscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_definition_id: String,
    pub status: WorkflowStatus,
    pub schedule_description: Option<String>,
    pub external_trigger_id: Option<String>,
    /// Optimistic concurrency token, bumped on every persisted write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowSubscription {
    /// A fresh OFF subscription, as created during tenant onboarding
    pub fn new(tenant_id: Uuid, workflow_definition_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_definition_id: workflow_definition_id.into(),
            status: WorkflowStatus::Off,
            schedule_description: None,
            external_trigger_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule_description = Some(schedule.into());
        self
    }

    /// Trigger id registered with the execution engine for this subscription
    pub fn trigger_id(&self) -> String {
        format!("workflow-{}", self.id)
    }

    pub fn is_on(&self) -> bool {
        self.status == WorkflowStatus::On
    }

    /// Whether the record satisfies the ON ⇔ trigger-id pairing
    pub fn is_consistent(&self) -> bool {
        match self.status {
            WorkflowStatus::On => self.external_trigger_id.is_some(),
            WorkflowStatus::Off => self.external_trigger_id.is_none(),
        }
    }
}

/// How a triggered run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Succeeded,
    /// The breaker refused the call; nothing was attempted
    Skipped,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "Succeeded",
            RunOutcome::Skipped => "Skipped",
            RunOutcome::Failed => "Failed",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = KainosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Succeeded" => Ok(RunOutcome::Succeeded),
            "Skipped" => Ok(RunOutcome::Skipped),
            "Failed" => Ok(RunOutcome::Failed),
            other => Err(KainosError::InvalidInput(format!("unknown run outcome '{}'", other))),
        }
    }
}

/// Result of one execution of a subscribed workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub outcome: RunOutcome,
    pub output: Option<serde_json::Value>,
    pub finished_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(subscription_id: Uuid, outcome: RunOutcome, output: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            outcome,
            output,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&WorkflowStatus::On).unwrap(), "\"ON\"");
        let off: WorkflowStatus = serde_json::from_str("\"OFF\"").unwrap();
        assert_eq!(off, WorkflowStatus::Off);
        assert!(serde_json::from_str::<WorkflowStatus>("\"on\"").is_err());
        assert!("maybe".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_new_subscription_is_off_and_consistent() {
        let sub = WorkflowSubscription::new(Uuid::new_v4(), "daily-digest");
        assert_eq!(sub.status, WorkflowStatus::Off);
        assert_eq!(sub.version, 0);
        assert!(sub.is_consistent());
        assert_eq!(sub.trigger_id(), format!("workflow-{}", sub.id));
    }

    #[test]
    fn test_on_without_trigger_is_inconsistent() {
        let mut sub = WorkflowSubscription::new(Uuid::new_v4(), "daily-digest");
        sub.status = WorkflowStatus::On;
        assert!(!sub.is_consistent());
        sub.external_trigger_id = Some(sub.trigger_id());
        assert!(sub.is_consistent());
    }

    #[test]
    fn test_tenant_display_name() {
        let tenant = Tenant::new("user_1", "ada@example.com");
        assert_eq!(tenant.display_name(), "ada@example.com");
        let tenant = tenant.with_names(Some("Ada".into()), Some("Lovelace".into()));
        assert_eq!(tenant.display_name(), "Ada Lovelace");
    }
}
