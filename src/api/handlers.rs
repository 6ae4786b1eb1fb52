// Request handlers for the Kainos API

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{ApiError, ErrorDetail, ErrorResponse};
use super::webhook::WebhookVerifier;
use crate::bus::EventBus;
use crate::engine::{IdentityUser, SubscriptionStore, TenantService, TriggerLifecycleManager};
use crate::models::{Tenant, WorkflowStatus, WorkflowSubscription};
use crate::KainosError;

pub const SERVICE_NAME: &str = "kainos-core-api";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<TriggerLifecycleManager>,
    pub tenants: Arc<TenantService>,
    pub bus: EventBus,
    /// `None` disables signature checks on the identity webhook
    pub webhook: Option<Arc<WebhookVerifier>>,
}

impl AppState {
    pub fn new(
        lifecycle: Arc<TriggerLifecycleManager>,
        tenants: Arc<TenantService>,
        bus: EventBus,
    ) -> Self {
        Self {
            lifecycle,
            tenants,
            bus,
            webhook: None,
        }
    }

    pub fn with_webhook_verifier(mut self, verifier: WebhookVerifier) -> Self {
        self.webhook = Some(Arc::new(verifier));
        self
    }

    fn store(&self) -> &Arc<dyn SubscriptionStore> {
        self.lifecycle.store()
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "bus_connected": state.bus.is_connected(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Fallback for unknown routes
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: "The requested resource was not found".to_string(),
                error_type: "not_found_error".to_string(),
            },
        }),
    )
}

// ---------------------------------------------------------------------------
// Identity webhook
// ---------------------------------------------------------------------------

/// Envelope posted by the identity provider
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityWebhook {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAddress {
    pub id: String,
    pub email_address: String,
}

/// `data` of `user.created` and `user.updated`
#[derive(Debug, Clone, Deserialize)]
pub struct UserData {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email_addresses: Vec<EmailAddress>,
    #[serde(default)]
    pub primary_email_address_id: Option<String>,
}

impl UserData {
    /// Primary address if flagged, otherwise the first one listed
    pub fn primary_email(&self) -> Option<&str> {
        self.primary_email_address_id
            .as_deref()
            .and_then(|primary| self.email_addresses.iter().find(|e| e.id == primary))
            .or_else(|| self.email_addresses.first())
            .map(|e| e.email_address.as_str())
    }

    pub fn into_identity(self) -> IdentityUser {
        let email = self.primary_email().unwrap_or_default().to_string();
        IdentityUser {
            external_id: self.id,
            email,
            first_name: self.first_name.filter(|s| !s.is_empty()),
            last_name: self.last_name.filter(|s| !s.is_empty()),
        }
    }
}

/// `data` of `user.deleted`
#[derive(Debug, Clone, Deserialize)]
pub struct DeletedUserData {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

fn parse_data<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, KainosError> {
    serde_json::from_value(data)
        .map_err(|e| KainosError::InvalidInput(format!("invalid webhook data: {}", e)))
}

/// POST /webhooks/identity
pub async fn identity_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(verifier) = &state.webhook {
        verifier.verify(&headers, &body, Utc::now().timestamp())?;
    }

    let webhook: IdentityWebhook = serde_json::from_slice(&body)
        .map_err(|e| KainosError::InvalidInput(format!("invalid webhook body: {}", e)))?;
    debug!("Identity webhook {} received", webhook.event_type);

    let response = match webhook.event_type.as_str() {
        "user.created" => {
            let user = parse_data::<UserData>(webhook.data)?.into_identity();
            let onboarded = state.tenants.user_created(&user).await?;
            (
                StatusCode::CREATED,
                Json(json!({
                    "message": "user created",
                    "tenant": onboarded.tenant,
                    "subscriptions": onboarded.subscriptions.len(),
                })),
            )
        }
        "user.updated" => {
            let user = parse_data::<UserData>(webhook.data)?.into_identity();
            let tenant = state.tenants.user_updated(&user).await?;
            (
                StatusCode::OK,
                Json(json!({ "message": "user updated", "tenant": tenant })),
            )
        }
        "user.deleted" => {
            let data = parse_data::<DeletedUserData>(webhook.data)?;
            if !data.deleted {
                warn!("user.deleted for {} without the deleted flag", data.id);
            }
            let tenant = state.tenants.user_deleted(&data.id).await?;
            (
                StatusCode::OK,
                Json(json!({ "message": "user deleted", "tenant": tenant })),
            )
        }
        other => {
            info!("Ignoring identity webhook {}", other);
            (
                StatusCode::OK,
                Json(json!({ "message": "event type not handled" })),
            )
        }
    };
    Ok(response)
}

// ---------------------------------------------------------------------------
// Tenant workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MyWorkflowsQuery {
    pub tenant_id: Option<Uuid>,
    /// Identity-provider user id, accepted in place of `tenant_id`
    pub external_id: Option<String>,
}

/// A subscription with its catalog name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowView {
    #[serde(flatten)]
    pub subscription: WorkflowSubscription,
    pub workflow_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    #[serde(alias = "cron_time")]
    pub schedule: String,
    pub status: String,
}

async fn resolve_tenant(state: &AppState, query: &MyWorkflowsQuery) -> Result<Tenant, KainosError> {
    let tenant = match (&query.tenant_id, &query.external_id) {
        (Some(id), _) => state.store().get_tenant(id).await?,
        (None, Some(external_id)) => state.store().get_tenant_by_external_id(external_id).await?,
        (None, None) => {
            return Err(KainosError::InvalidInput(
                "tenant_id or external_id is required".to_string(),
            ))
        }
    };
    tenant
        .filter(|t| !t.is_deleted())
        .ok_or_else(|| KainosError::NotFound("tenant".to_string()))
}

/// GET /api/v1/workflows/my-workflows
pub async fn list_my_workflows(
    State(state): State<AppState>,
    Query(query): Query<MyWorkflowsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = resolve_tenant(&state, &query).await?;
    let names: HashMap<String, String> = state
        .store()
        .list_catalog()
        .await?
        .into_iter()
        .map(|w| (w.id, w.name))
        .collect();

    let workflows: Vec<WorkflowView> = state
        .store()
        .list_subscriptions_for_tenant(&tenant.id)
        .await?
        .into_iter()
        .map(|subscription| WorkflowView {
            workflow_name: names.get(&subscription.workflow_definition_id).cloned(),
            subscription,
        })
        .collect();

    Ok(Json(json!({
        "count": workflows.len(),
        "workflows": workflows,
    })))
}

/// PATCH /api/v1/workflows/:id/status
pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status: WorkflowStatus = request.status.parse()?;
    let workflow = state.lifecycle.set_status(&id, status).await?;
    info!("🔁 Workflow {} switched {}", id, workflow.status);
    Ok(Json(json!({
        "message": format!("workflow status updated to {}", workflow.status),
        "workflow": workflow,
    })))
}

/// PATCH /api/v1/workflows/:id/schedule
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status: WorkflowStatus = request.status.parse()?;
    let workflow = state
        .lifecycle
        .update_schedule(&id, &request.schedule, status)
        .await?;
    info!(
        "🗓️ Workflow {} scheduled '{}' ({})",
        id, request.schedule, workflow.status
    );
    Ok(Json(json!({
        "message": "workflow schedule updated",
        "workflow": workflow,
    })))
}

/// POST /api/v1/workflows/:id/reconcile
pub async fn reconcile_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = state.lifecycle.reconcile_by_id(&id).await?;
    Ok(Json(json!({
        "message": "workflow reconciled",
        "workflow": workflow,
    })))
}
