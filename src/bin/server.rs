// Kainos Core - Main API Server
// Identity webhooks, workflow toggles and the trigger engine in one process
// Run with: cargo run --bin server

//! # Kainos Server Binary
//!
//! Starts everything the core service needs:
//!
//! ```text
//! main()
//!   ↓ loads
//! AppConfig (defaults → kainos.toml → KAINOS__* env)
//!   ↓ builds
//! Services (store, bus, trigger engine, lifecycle manager, tenants)
//!   ↓ reconciles
//! every stored subscription against the engine
//!   ↓ serves
//! ApiServer (axum) until Ctrl-C
//! ```
//!
//! With `engine.kind = "local"` the fired triggers run in this process through
//! the registered agent activities. With `engine.kind = "temporal"` this
//! process only manages schedules and a Temporal worker runs them.
//!
//! ## Rust Learning Notes:
//!
//! ### anyhow in Binaries
//! The library returns the typed `KainosError`; `main` only needs to report
//! failures, so it uses `anyhow::Result` and lets `?` convert.

use anyhow::Result;
use dotenv::dotenv;
use tracing::{error, info, warn};

use kainos::api::ApiServer;
use kainos::server::{init_tracing, seed_default_catalog, Services};
use kainos::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real deployments set the environment directly
    let dotenv_result = dotenv();
    init_tracing("info");
    if let Err(e) = dotenv_result {
        warn!("No .env file loaded: {}", e);
    }

    info!("🚀 Starting Kainos Core API...");
    info!("=====================================");

    let config = AppConfig::load()?;
    info!("Server: {}", config.api_config().address());
    info!("Engine: {:?}", config.engine.kind);
    info!(
        "Store: {}",
        if config.database.url.is_some() { "postgres" } else { "in-memory" }
    );
    if config.agent_api.api_key.is_some() {
        info!("✅ Agent API key configured");
    }

    let services = Services::build(config).await?;
    seed_default_catalog(services.store.as_ref()).await?;

    match services.lifecycle.reconcile_all().await {
        Ok(report) => {
            info!(
                "🔄 Startup reconcile: {}/{} converged, {} failed",
                report.converged,
                report.total,
                report.failed.len()
            );
            for failure in &report.failed {
                warn!("  {}: {}", failure.subscription_id, failure.error);
            }
        }
        Err(e) => error!("❌ Startup reconcile failed: {}", e),
    }

    let server = ApiServer::new(services.config.api_config(), services.app_state()?);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ Failed to listen for Ctrl-C: {}", e);
            futures::future::pending::<()>().await;
        }
        info!("🛑 Shutdown requested");
    };

    let served = server.run_until(shutdown).await;
    services.shutdown().await;
    served
}
