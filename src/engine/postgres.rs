// PostgreSQL implementation of SubscriptionStore

//! # Postgres Store
//!
//! [`PgStore`] backs the platform with PostgreSQL through a sqlx connection
//! pool. Queries are checked at runtime (`sqlx::query`) so the crate builds
//! without a live database.
//!
//! Every subscription write is a conditional update:
//!
//! ```sql
//! UPDATE workflow_subscriptions SET ..., version = version + 1
//!  WHERE id = $1 AND version = $2
//! RETURNING ...
//! ```
//!
//! Zero rows back means either the row is gone or another writer bumped the
//! version first; a follow-up existence check tells the two apart.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::storage::SubscriptionStore;
use crate::models::{
    CatalogWorkflow, RunOutcome, Tenant, WorkflowRun, WorkflowStatus, WorkflowSubscription,
};
use crate::{KainosError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id UUID PRIMARY KEY,
    external_id TEXT NOT NULL,
    email TEXT NOT NULL,
    first_name TEXT,
    last_name TEXT,
    deleted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS tenants_live_external_id
    ON tenants (external_id) WHERE deleted_at IS NULL;
CREATE TABLE IF NOT EXISTS workflow_catalog (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    default_schedule TEXT
);
CREATE TABLE IF NOT EXISTS workflow_subscriptions (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants (id),
    workflow_definition_id TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('ON', 'OFF')),
    schedule_description TEXT,
    external_trigger_id TEXT,
    version BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, workflow_definition_id)
);
CREATE TABLE IF NOT EXISTS workflow_runs (
    id UUID PRIMARY KEY,
    subscription_id UUID NOT NULL REFERENCES workflow_subscriptions (id),
    outcome TEXT NOT NULL,
    output TEXT,
    finished_at TIMESTAMPTZ NOT NULL
)
"#;

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, workflow_definition_id, status, \
    schedule_description, external_trigger_id, version, created_at, updated_at";

const TENANT_COLUMNS: &str =
    "id, external_id, email, first_name, last_name, deleted_at, created_at, updated_at";

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool to `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!("✅ Connected to PostgreSQL (pool size {})", max_connections);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("📋 Database schema is up to date");
        Ok(())
    }

    async fn subscription_exists(&self, id: &Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM workflow_subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn conflict_on_unique(err: sqlx::Error, what: impl FnOnce() -> String) -> KainosError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => KainosError::Conflict(what()),
        _ => KainosError::Database(err),
    }
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant> {
    Ok(Tenant {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<WorkflowSubscription> {
    let status: String = row.try_get("status")?;
    Ok(WorkflowSubscription {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        workflow_definition_id: row.try_get("workflow_definition_id")?,
        status: WorkflowStatus::from_str(&status)?,
        schedule_description: row.try_get("schedule_description")?,
        external_trigger_id: row.try_get("external_trigger_id")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn catalog_from_row(row: &PgRow) -> Result<CatalogWorkflow> {
    Ok(CatalogWorkflow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        default_schedule: row.try_get("default_schedule")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<WorkflowRun> {
    let outcome: String = row.try_get("outcome")?;
    let output: Option<String> = row.try_get("output")?;
    let finished_at: DateTime<Utc> = row.try_get("finished_at")?;
    Ok(WorkflowRun {
        id: row.try_get("id")?,
        subscription_id: row.try_get("subscription_id")?,
        outcome: RunOutcome::from_str(&outcome)?,
        output: output.map(|s| serde_json::from_str(&s)).transpose()?,
        finished_at,
    })
}

#[async_trait::async_trait]
impl SubscriptionStore for PgStore {
    async fn create_tenant(&self, tenant: Tenant) -> Result<Tenant> {
        sqlx::query(
            "INSERT INTO tenants (id, external_id, email, first_name, last_name, deleted_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(tenant.id)
        .bind(&tenant.external_id)
        .bind(&tenant.email)
        .bind(&tenant.first_name)
        .bind(&tenant.last_name)
        .bind(tenant.deleted_at)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("tenant with external id '{}' already exists", tenant.external_id)
            })
        })?;
        Ok(tenant)
    }

    async fn get_tenant(&self, id: &Uuid) -> Result<Option<Tenant>> {
        let query = format!("SELECT {} FROM tenants WHERE id = $1", TENANT_COLUMNS);
        sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(tenant_from_row)
            .transpose()
    }

    async fn get_tenant_by_external_id(&self, external_id: &str) -> Result<Option<Tenant>> {
        let query = format!(
            "SELECT {} FROM tenants WHERE external_id = $1 AND deleted_at IS NULL",
            TENANT_COLUMNS
        );
        sqlx::query(&query)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(tenant_from_row)
            .transpose()
    }

    async fn update_tenant(&self, tenant: Tenant) -> Result<Tenant> {
        let query = format!(
            "UPDATE tenants SET email = $2, first_name = $3, last_name = $4, updated_at = now() \
             WHERE id = $1 RETURNING {}",
            TENANT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(tenant.id)
            .bind(&tenant.email)
            .bind(&tenant.first_name)
            .bind(&tenant.last_name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| KainosError::NotFound(format!("tenant {}", tenant.id)))?;
        tenant_from_row(&row)
    }

    async fn soft_delete_tenant(&self, id: &Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenants SET deleted_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(KainosError::NotFound(format!("tenant {}", id)));
        }
        Ok(())
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogWorkflow>> {
        sqlx::query("SELECT id, name, description, default_schedule FROM workflow_catalog ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(catalog_from_row)
            .collect()
    }

    async fn upsert_catalog_workflow(&self, workflow: CatalogWorkflow) -> Result<CatalogWorkflow> {
        sqlx::query(
            "INSERT INTO workflow_catalog (id, name, description, default_schedule) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, \
             description = EXCLUDED.description, default_schedule = EXCLUDED.default_schedule",
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.default_schedule)
        .execute(&self.pool)
        .await?;
        Ok(workflow)
    }

    async fn create_subscription(&self, sub: WorkflowSubscription) -> Result<WorkflowSubscription> {
        sqlx::query(
            "INSERT INTO workflow_subscriptions \
             (id, tenant_id, workflow_definition_id, status, schedule_description, \
              external_trigger_id, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(sub.id)
        .bind(sub.tenant_id)
        .bind(&sub.workflow_definition_id)
        .bind(sub.status.as_str())
        .bind(&sub.schedule_description)
        .bind(&sub.external_trigger_id)
        .bind(sub.version)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!(
                    "tenant {} is already subscribed to '{}'",
                    sub.tenant_id, sub.workflow_definition_id
                )
            })
        })?;
        Ok(sub)
    }

    async fn get_subscription(&self, id: &Uuid) -> Result<Option<WorkflowSubscription>> {
        let query = format!(
            "SELECT {} FROM workflow_subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(subscription_from_row)
            .transpose()
    }

    async fn list_subscriptions_for_tenant(&self, tenant_id: &Uuid) -> Result<Vec<WorkflowSubscription>> {
        let query = format!(
            "SELECT {} FROM workflow_subscriptions WHERE tenant_id = $1 ORDER BY workflow_definition_id",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query(&query)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(subscription_from_row)
            .collect()
    }

    async fn list_subscriptions(&self) -> Result<Vec<WorkflowSubscription>> {
        let query = format!(
            "SELECT {} FROM workflow_subscriptions ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query(&query)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(subscription_from_row)
            .collect()
    }

    async fn update_subscription(
        &self,
        sub: WorkflowSubscription,
        expected_version: i64,
    ) -> Result<WorkflowSubscription> {
        let query = format!(
            "UPDATE workflow_subscriptions \
             SET status = $3, schedule_description = $4, external_trigger_id = $5, \
                 version = version + 1, updated_at = now() \
             WHERE id = $1 AND version = $2 \
             RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(sub.id)
            .bind(expected_version)
            .bind(sub.status.as_str())
            .bind(&sub.schedule_description)
            .bind(&sub.external_trigger_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => subscription_from_row(&row),
            None if self.subscription_exists(&sub.id).await? => Err(KainosError::Conflict(format!(
                "subscription {} changed since version {}",
                sub.id, expected_version
            ))),
            None => Err(KainosError::NotFound(format!("subscription {}", sub.id))),
        }
    }

    async fn record_run(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        let output = run.output.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            "INSERT INTO workflow_runs (id, subscription_id, outcome, output, finished_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run.id)
        .bind(run.subscription_id)
        .bind(run.outcome.as_str())
        .bind(output)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    async fn list_runs(&self, subscription_id: &Uuid) -> Result<Vec<WorkflowRun>> {
        sqlx::query(
            "SELECT id, subscription_id, outcome, output, finished_at FROM workflow_runs \
             WHERE subscription_id = $1 ORDER BY finished_at",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(run_from_row)
        .collect()
    }
}
