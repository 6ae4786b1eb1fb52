// Router-level tests for the Kainos API

use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use super::handlers::AppState;
use super::webhook::{WebhookVerifier, ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::{ApiConfig, ApiServer};
use crate::bus::{transport::InMemoryTransport, EventBus};
use crate::engine::{
    InMemoryStore, InMemoryTriggerEngine, LifecycleConfig, SubscriptionStore, TenantService,
    TriggerLifecycleManager,
};
use crate::models::{CatalogWorkflow, WorkflowStatus};

const SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

struct Fixture {
    store: Arc<InMemoryStore>,
    engine: Arc<InMemoryTriggerEngine>,
    state: AppState,
}

impl Fixture {
    fn router(&self) -> Router {
        ApiServer::new(ApiConfig::default(), self.state.clone()).create_router()
    }
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryStore::with_catalog(vec![
        CatalogWorkflow {
            id: "market-digest".to_string(),
            name: "Market digest".to_string(),
            description: None,
            default_schedule: Some("market-open".to_string()),
        },
        CatalogWorkflow {
            id: "portfolio-review".to_string(),
            name: "Portfolio review".to_string(),
            description: None,
            default_schedule: Some("weekly-monday-9am".to_string()),
        },
    ]));
    let engine = Arc::new(InMemoryTriggerEngine::new());
    let lifecycle = Arc::new(TriggerLifecycleManager::new(
        engine.clone(),
        store.clone(),
        LifecycleConfig::default(),
    ));
    let bus = EventBus::new(Arc::new(InMemoryTransport::new()));
    let tenants = Arc::new(TenantService::new(
        store.clone(),
        lifecycle.clone(),
        bus.clone(),
    ));
    Fixture {
        store,
        engine,
        state: AppState::new(lifecycle, tenants, bus),
    }
}

fn user_created_body(id: &str) -> Value {
    json!({
        "type": "user.created",
        "object": "event",
        "timestamp": 1_700_000_000_000i64,
        "data": {
            "id": id,
            "first_name": "Ada",
            "last_name": "Lovelace",
            "primary_email_address_id": "idn_2",
            "email_addresses": [
                { "id": "idn_1", "email_address": "old@example.com" },
                { "id": "idn_2", "email_address": "ada@example.com" }
            ]
        }
    })
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let mut body = response.into_body();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    serde_json::from_slice(&bytes).unwrap()
}

async fn onboard(f: &Fixture, id: &str) -> Uuid {
    let response = f
        .router()
        .oneshot(json_request("POST", "/webhooks/identity", &user_created_body(id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    f.store
        .get_tenant_by_external_id(id)
        .await
        .unwrap()
        .unwrap()
        .id
}

async fn subscription_id(f: &Fixture, tenant: Uuid, workflow: &str) -> Uuid {
    f.store
        .list_subscriptions_for_tenant(&tenant)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.workflow_definition_id == workflow)
        .unwrap()
        .id
}

#[tokio::test]
async fn test_health_check() {
    let f = fixture();
    let response = f.router().oneshot(empty_request("GET", "/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bus_connected"], true);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let f = fixture();
    let response = f.router().oneshot(empty_request("GET", "/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_user_created_onboards_tenant() {
    let f = fixture();
    let tenant_id = onboard(&f, "user_ada").await;

    let tenant = f.store.get_tenant(&tenant_id).await.unwrap().unwrap();
    assert_eq!(tenant.email, "ada@example.com");
    assert_eq!(
        f.store.list_subscriptions_for_tenant(&tenant_id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_unhandled_webhook_type_is_acknowledged() {
    let f = fixture();
    let body = json!({ "type": "session.created", "data": {} });
    let response = f
        .router()
        .oneshot(json_request("POST", "/webhooks/identity", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "event type not handled");
}

#[tokio::test]
async fn test_user_created_without_email_is_rejected() {
    let f = fixture();
    let body = json!({ "type": "user.created", "data": { "id": "user_x", "email_addresses": [] } });
    let response = f
        .router()
        .oneshot(json_request("POST", "/webhooks/identity", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_signed_webhook() {
    let mut f = fixture();
    let verifier = WebhookVerifier::from_secret(SECRET).unwrap();
    let signer = WebhookVerifier::from_secret(SECRET).unwrap();
    f.state = f.state.clone().with_webhook_verifier(verifier);

    let body = user_created_body("user_signed").to_string();
    let ts = Utc::now().timestamp();

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhooks/identity")
        .body(Body::from(body.clone()))
        .unwrap();
    let response = f.router().oneshot(unsigned).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let signed = Request::builder()
        .method("POST")
        .uri("/webhooks/identity")
        .header(ID_HEADER, "msg_1")
        .header(TIMESTAMP_HEADER, ts.to_string())
        .header(SIGNATURE_HEADER, signer.sign("msg_1", ts, body.as_bytes()))
        .body(Body::from(body))
        .unwrap();
    let response = f.router().oneshot(signed).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_my_workflows_lists_catalog_subscriptions() {
    let f = fixture();
    let tenant_id = onboard(&f, "user_ada").await;

    let uri = format!("/api/v1/workflows/my-workflows?tenant_id={}", tenant_id);
    let response = f.router().oneshot(empty_request("GET", &uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["count"], 2);
    let names: Vec<&str> = body["workflows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["workflow_name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"Market digest"));
    assert!(body["workflows"]
        .as_array()
        .unwrap()
        .iter()
        .all(|w| w["status"] == "OFF"));

    let by_external = f
        .router()
        .oneshot(empty_request(
            "GET",
            "/api/v1/workflows/my-workflows?external_id=user_ada",
        ))
        .await
        .unwrap();
    assert_eq!(body_json(by_external).await["count"], 2);
}

#[tokio::test]
async fn test_my_workflows_requires_known_tenant() {
    let f = fixture();
    let missing = f
        .router()
        .oneshot(empty_request("GET", "/api/v1/workflows/my-workflows"))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let uri = format!("/api/v1/workflows/my-workflows?tenant_id={}", Uuid::new_v4());
    let unknown = f.router().oneshot(empty_request("GET", &uri)).await.unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_toggle_creates_and_removes_trigger() {
    let f = fixture();
    let tenant_id = onboard(&f, "user_ada").await;
    let sub_id = subscription_id(&f, tenant_id, "market-digest").await;
    let uri = format!("/api/v1/workflows/{}/status", sub_id);

    let response = f
        .router()
        .oneshot(json_request("PATCH", &uri, &json!({ "status": "ON" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["workflow"]["status"], "ON");
    assert_eq!(body["workflow"]["schedule_description"], "market-open");
    assert!(f.engine.contains(&format!("workflow-{}", sub_id)));

    let response = f
        .router()
        .oneshot(json_request("PATCH", &uri, &json!({ "status": "OFF" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(f.engine.is_empty());
}

#[tokio::test]
async fn test_status_rejects_bad_values() {
    let f = fixture();
    let tenant_id = onboard(&f, "user_ada").await;
    let sub_id = subscription_id(&f, tenant_id, "market-digest").await;

    let uri = format!("/api/v1/workflows/{}/status", sub_id);
    let response = f
        .router()
        .oneshot(json_request("PATCH", &uri, &json!({ "status": "MAYBE" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let uri = format!("/api/v1/workflows/{}/status", Uuid::new_v4());
    let response = f
        .router()
        .oneshot(json_request("PATCH", &uri, &json!({ "status": "ON" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_engine_failure_maps_to_bad_gateway() {
    let f = fixture();
    let tenant_id = onboard(&f, "user_ada").await;
    let sub_id = subscription_id(&f, tenant_id, "market-digest").await;
    f.engine.fail_creates(true);

    let uri = format!("/api/v1/workflows/{}/status", sub_id);
    let response = f
        .router()
        .oneshot(json_request("PATCH", &uri, &json!({ "status": "ON" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let sub = f.store.get_subscription(&sub_id).await.unwrap().unwrap();
    assert_eq!(sub.status, WorkflowStatus::Off);
}

#[tokio::test]
async fn test_schedule_update_accepts_cron_time_alias() {
    let f = fixture();
    let tenant_id = onboard(&f, "user_ada").await;
    let sub_id = subscription_id(&f, tenant_id, "portfolio-review").await;
    let uri = format!("/api/v1/workflows/{}/schedule", sub_id);

    let response = f
        .router()
        .oneshot(json_request(
            "PATCH",
            &uri,
            &json!({ "cron_time": "13:45", "status": "ON" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["workflow"]["schedule_description"], "13:45");
    assert_eq!(body["workflow"]["status"], "ON");
    assert_eq!(f.engine.len(), 1);

    let response = f
        .router()
        .oneshot(json_request(
            "PATCH",
            &uri,
            &json!({ "schedule": "every-fortnight", "status": "ON" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_reconcile_restores_missing_trigger() {
    let f = fixture();
    let tenant_id = onboard(&f, "user_ada").await;
    let sub_id = subscription_id(&f, tenant_id, "market-digest").await;
    f.state
        .lifecycle
        .set_status(&sub_id, WorkflowStatus::On)
        .await
        .unwrap();

    let trigger_id = format!("workflow-{}", sub_id);
    f.engine.remove(&trigger_id);
    assert!(!f.engine.contains(&trigger_id));

    let uri = format!("/api/v1/workflows/{}/reconcile", sub_id);
    let response = f.router().oneshot(empty_request("POST", &uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(f.engine.contains(&trigger_id));
}

#[tokio::test]
async fn test_user_deleted_offboards_tenant() {
    let f = fixture();
    let tenant_id = onboard(&f, "user_ada").await;
    let sub_id = subscription_id(&f, tenant_id, "market-digest").await;
    f.state
        .lifecycle
        .set_status(&sub_id, WorkflowStatus::On)
        .await
        .unwrap();

    let body = json!({
        "type": "user.deleted",
        "data": { "id": "user_ada", "deleted": true, "object": "user" }
    });
    let response = f
        .router()
        .oneshot(json_request("POST", "/webhooks/identity", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(f.engine.is_empty());

    let tenant = f.store.get_tenant(&tenant_id).await.unwrap().unwrap();
    assert!(tenant.is_deleted());

    let uri = format!("/api/v1/workflows/my-workflows?tenant_id={}", tenant_id);
    let response = f.router().oneshot(empty_request("GET", &uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
