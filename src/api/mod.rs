// Kainos HTTP API
// Identity webhooks and tenant workflow management over axum

pub mod errors;
pub mod handlers;
pub mod webhook;

#[cfg(test)]
mod handlers_tests;

use std::future::Future;

use axum::{
    routing::{get, patch, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use errors::{ApiError, ErrorResponse};
pub use handlers::AppState;
pub use webhook::WebhookVerifier;

use handlers::{
    health_check, identity_webhook, list_my_workflows, not_found, reconcile_workflow,
    update_schedule, update_status,
};

/// API server configuration
#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub port: u16,
    pub host: String,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            cors_enabled: true,
        }
    }
}

impl ApiConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Core API server
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.config.cors_enabled = enabled;
        self
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Create the Axum router with every route
    pub fn create_router(&self) -> Router {
        let app = Router::new()
            .route("/health", get(health_check))
            .route("/webhooks/identity", post(identity_webhook))
            .route("/api/v1/workflows/my-workflows", get(list_my_workflows))
            .route("/api/v1/workflows/:id/status", patch(update_status))
            .route("/api/v1/workflows/:id/schedule", patch(update_schedule))
            .route("/api/v1/workflows/:id/reconcile", post(reconcile_workflow))
            .fallback(not_found)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.create_router();
        let addr = self.config.address();

        info!("🚀 Kainos API server starting");
        info!("📡 Server address: http://{}", addr);
        info!("🔗 API endpoints:");
        info!("  POST  /webhooks/identity");
        info!("  GET   /api/v1/workflows/my-workflows");
        info!("  PATCH /api/v1/workflows/:id/status");
        info!("  PATCH /api/v1/workflows/:id/schedule");
        info!("  POST  /api/v1/workflows/:id/reconcile");
        info!("  GET   /health");

        axum::Server::bind(&addr.parse()?)
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("🛑 Kainos API server stopped");
        Ok(())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(futures::future::pending()).await
    }
}
