// Kainos service wiring
// Builds stores, engines and the bus from an AppConfig

//! # Server Module
//!
//! The binaries share one way of turning configuration into running
//! components:
//!
//! ```text
//! AppConfig
//!   ↓ connect_store      PgStore, or InMemoryStore when no database.url
//!   ↓ connect_bus        NATS, or an in-process transport when nats.enabled = false
//!   ↓ build_engine       LocalTriggerEngine (+ agent activities) or TemporalHttpEngine
//!   ↓
//! Services { lifecycle, tenants, bus, ... }
//!   ↓ app_state
//! ApiServer
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects for Runtime Choice
//! The store and the engine are picked from configuration at startup, so they
//! are held as `Arc<dyn SubscriptionStore>` and `Arc<dyn TriggerEngine>`.
//! Everything downstream is written against the traits and never learns
//! which adapter it got.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{AppState, WebhookVerifier};
use crate::bus::nats::NatsTransport;
use crate::bus::{transport::InMemoryTransport, EventBus};
use crate::engine::activities::AgentActivities;
use crate::engine::{
    CircuitBreaker, InMemoryStore, LocalTriggerEngine, PgStore, ResilientClient,
    SubscriptionStore, TemporalHttpEngine, TenantService, TriggerEngine,
    TriggerLifecycleManager, WorkflowRegistry,
};
use crate::models::CatalogWorkflow;
use crate::settings::{AppConfig, EngineKind};
use crate::Result;

/// How long shutdown waits for local workflow runs to finish
pub const RUN_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Install the global fmt subscriber; `RUST_LOG` wins over `default_directive`
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Workflows every new installation starts with
pub fn default_catalog() -> Vec<CatalogWorkflow> {
    vec![
        CatalogWorkflow {
            id: "market-open-briefing".to_string(),
            name: "Market open briefing".to_string(),
            description: Some("Pre-market summary delivered at the opening bell".to_string()),
            default_schedule: Some("market-open".to_string()),
        },
        CatalogWorkflow {
            id: "daily-portfolio-summary".to_string(),
            name: "Daily portfolio summary".to_string(),
            description: Some("End of day positions and performance".to_string()),
            default_schedule: Some("daily-5pm".to_string()),
        },
        CatalogWorkflow {
            id: "weekly-review".to_string(),
            name: "Weekly review".to_string(),
            description: Some("Monday morning look back at the previous week".to_string()),
            default_schedule: Some("weekly-monday-9am".to_string()),
        },
    ]
}

/// Insert the default catalog when the store has none; returns how many were added
pub async fn seed_default_catalog(store: &dyn SubscriptionStore) -> Result<usize> {
    if !store.list_catalog().await?.is_empty() {
        return Ok(0);
    }
    let catalog = default_catalog();
    let count = catalog.len();
    for workflow in catalog {
        store.upsert_catalog_workflow(workflow).await?;
    }
    info!("📋 Seeded {} default catalog workflows", count);
    Ok(count)
}

pub async fn connect_store(config: &AppConfig) -> Result<Arc<dyn SubscriptionStore>> {
    match &config.database.url {
        Some(url) => {
            let store = PgStore::connect(url, config.database.max_connections).await?;
            if config.database.run_migrations {
                store.migrate().await?;
            }
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database.url configured, using the in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Event bus plus the raw NATS client when one was connected
pub async fn connect_bus(config: &AppConfig) -> Result<(EventBus, Option<async_nats::Client>)> {
    if config.nats.enabled {
        let transport = NatsTransport::connect_with_retry(&config.nats_options()).await?;
        let client = transport.client().clone();
        Ok((EventBus::new(Arc::new(transport)), Some(client)))
    } else {
        warn!("NATS disabled, events stay inside this process");
        Ok((EventBus::new(Arc::new(InMemoryTransport::new())), None))
    }
}

/// Breaker-guarded client for the agent API
pub fn agent_client(config: &AppConfig) -> Result<ResilientClient> {
    let breaker = Arc::new(CircuitBreaker::new(config.agent_breaker()));
    let client = ResilientClient::new(breaker, Duration::from_secs(config.agent_api.timeout_secs))?
        .with_base_url(config.agent_api.base_url.clone())
        .with_retry_policy(config.agent_retry());
    match config.agent_api.api_key.as_deref() {
        Some(key) if !key.is_empty() => client.with_bearer_token(key),
        _ => Ok(client),
    }
}

/// The configured engine; the local one comes back separately for shutdown
pub fn build_engine(
    config: &AppConfig,
    store: Arc<dyn SubscriptionStore>,
) -> Result<(Arc<dyn TriggerEngine>, Option<Arc<LocalTriggerEngine>>)> {
    match config.engine.kind {
        EngineKind::Local => {
            let registry = Arc::new(WorkflowRegistry::new());
            let activities = Arc::new(AgentActivities::new(agent_client(config)?, store));
            activities.register(&registry);
            info!(
                "⚙️ Local trigger engine ready ({} workflows registered)",
                registry.workflow_names().len()
            );
            let engine = Arc::new(LocalTriggerEngine::new(registry));
            Ok((engine.clone(), Some(engine)))
        }
        EngineKind::Temporal => {
            let engine = TemporalHttpEngine::new(
                config.engine.temporal_url.clone(),
                config.engine.namespace.clone(),
                Duration::from_secs(config.engine.call_timeout_secs),
            )?;
            info!(
                "⚙️ Temporal engine at {} (namespace {})",
                config.engine.temporal_url, config.engine.namespace
            );
            Ok((Arc::new(engine), None))
        }
    }
}

/// Every long-lived component of the core service
pub struct Services {
    pub config: AppConfig,
    pub store: Arc<dyn SubscriptionStore>,
    pub bus: EventBus,
    pub nats: Option<async_nats::Client>,
    pub engine: Arc<dyn TriggerEngine>,
    pub local_engine: Option<Arc<LocalTriggerEngine>>,
    pub lifecycle: Arc<TriggerLifecycleManager>,
    pub tenants: Arc<TenantService>,
}

impl Services {
    pub async fn build(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let store = connect_store(&config).await?;
        let (bus, nats) = connect_bus(&config).await?;
        Self::assemble(config, store, bus, nats)
    }

    /// Wire components around an already connected store and bus
    pub fn assemble(
        config: AppConfig,
        store: Arc<dyn SubscriptionStore>,
        bus: EventBus,
        nats: Option<async_nats::Client>,
    ) -> Result<Self> {
        let (engine, local_engine) = build_engine(&config, store.clone())?;
        let lifecycle = Arc::new(TriggerLifecycleManager::new(
            engine.clone(),
            store.clone(),
            config.lifecycle_config(),
        ));
        let tenants = Arc::new(TenantService::new(
            store.clone(),
            lifecycle.clone(),
            bus.clone(),
        ));
        Ok(Self {
            config,
            store,
            bus,
            nats,
            engine,
            local_engine,
            lifecycle,
            tenants,
        })
    }

    pub fn app_state(&self) -> Result<AppState> {
        let state = AppState::new(self.lifecycle.clone(), self.tenants.clone(), self.bus.clone());
        match self.config.webhook.secret.as_deref() {
            Some(secret) if !secret.is_empty() => {
                Ok(state.with_webhook_verifier(WebhookVerifier::from_secret(secret)?))
            }
            _ => {
                warn!("No webhook.secret configured, identity webhooks are not verified");
                Ok(state)
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(engine) = &self.local_engine {
            engine.shutdown();
            let finished = engine.drain(RUN_DRAIN_GRACE).await;
            if finished > 0 {
                info!("⏳ Waited for {} in-flight runs", finished);
            }
        }
        if let Err(e) = self.bus.flush().await {
            warn!("Bus flush on shutdown failed: {}", e);
        }
        self.bus.shutdown();
        info!("🛑 Services stopped");
    }
}
