// Layered configuration for the Kainos binaries

//! # Settings
//!
//! [`AppConfig`] is read in three layers, later ones winning:
//!
//! 1. Built-in defaults (the `Default` impls below)
//! 2. An optional TOML file, `kainos.toml` unless `KAINOS_CONFIG` names another
//! 3. Environment variables such as `KAINOS__SERVER__PORT=9090` or
//!    `KAINOS__NATS__URL=nats://bus:4222`
//!
//! Durations are plain integers with the unit in the key name
//! (`call_timeout_secs`, `connect_wait_ms`).
//!
//! ## Rust Learning Notes:
//!
//! ### `#[serde(default)]`
//! Every section carries `#[serde(default)]`, so a file or environment only
//! has to mention the keys it changes. Missing keys fall back to `Default`.

use std::path::Path;
use std::time::Duration;

use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};

use crate::api::ApiConfig;
use crate::bus::nats::{NatsOptions, ReconnectPolicy};
use crate::engine::{BreakerSettings, LifecycleConfig, RetryPolicy};
use crate::notifier::SenderIdentity;
use crate::{KainosError, Result};

pub const ENV_PREFIX: &str = "KAINOS";
pub const ENV_SEPARATOR: &str = "__";
pub const DEFAULT_CONFIG_FILE: &str = "kainos.toml";
/// Environment variable naming an alternative config file
pub const CONFIG_FILE_VAR: &str = "KAINOS_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    /// `false` runs the bus in-process (single-binary development)
    pub enabled: bool,
    pub url: String,
    pub connect_attempts: u32,
    pub connect_wait_ms: u64,
    pub connection_timeout_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter_ms: u64,
    /// Absent means reconnect forever
    pub max_reconnects: Option<usize>,
}

impl Default for NatsSettings {
    fn default() -> Self {
        let options = NatsOptions::default();
        Self {
            enabled: true,
            url: options.url,
            connect_attempts: options.connect_attempts,
            connect_wait_ms: options.connect_wait.as_millis() as u64,
            connection_timeout_secs: options.connection_timeout.as_secs(),
            reconnect_base_ms: options.reconnect.base_delay.as_millis() as u64,
            reconnect_max_ms: options.reconnect.max_delay.as_millis() as u64,
            reconnect_jitter_ms: options.reconnect.jitter.as_millis() as u64,
            max_reconnects: options.reconnect.max_reconnects,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Absent means the in-memory store
    pub url: Option<String>,
    pub max_connections: u32,
    pub run_migrations: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            run_migrations: true,
        }
    }
}

/// Which trigger engine the server talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Local,
    Temporal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub kind: EngineKind,
    pub temporal_url: String,
    pub namespace: String,
    pub task_queue: String,
    pub call_timeout_secs: u64,
    pub run_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let lifecycle = LifecycleConfig::default();
        Self {
            kind: EngineKind::Local,
            temporal_url: "http://localhost:7243".to_string(),
            namespace: "default".to_string(),
            task_queue: lifecycle.task_queue,
            call_timeout_secs: lifecycle.call_timeout.as_secs(),
            run_attempts: lifecycle.run_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentApiSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_open_timeout_secs: u64,
    pub breaker_half_open_requests: u32,
}

impl Default for AgentApiSettings {
    fn default() -> Self {
        let breaker = BreakerSettings::agent_api();
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            timeout_secs: 30,
            retry_attempts: RetryPolicy::default().max_attempts,
            breaker_failure_threshold: breaker.failure_threshold,
            breaker_open_timeout_secs: breaker.open_timeout.as_secs(),
            breaker_half_open_requests: breaker.max_half_open_requests,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    pub resend_api_key: Option<String>,
    pub resend_base_url: String,
    pub from_email: String,
    pub from_name: String,
    pub timeout_secs: u64,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            resend_api_key: None,
            resend_base_url: crate::notifier::RESEND_BASE_URL.to_string(),
            from_email: "hello@kainos.local".to_string(),
            from_name: "Kainos".to_string(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    /// `whsec_...` signing secret; absent disables verification
    pub secret: Option<String>,
}

/// Complete configuration for every binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub nats: NatsSettings,
    pub database: DatabaseSettings,
    pub engine: EngineSettings,
    pub agent_api: AgentApiSettings,
    pub notifier: NotifierSettings,
    pub webhook: WebhookSettings,
}

impl AppConfig {
    /// Defaults, then the config file, then `KAINOS__*` variables
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Some(Path::new(&file)), ENV_PREFIX)
    }

    /// Load with an explicit file (optional on disk) and environment prefix
    pub fn load_from(file: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );
        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Checks shared by every binary
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(KainosError::Config("server.port must be non-zero".to_string()));
        }
        if self.nats.enabled && self.nats.url.trim().is_empty() {
            return Err(KainosError::Config("nats.url is required".to_string()));
        }
        if self.nats.connect_attempts == 0 {
            return Err(KainosError::Config(
                "nats.connect_attempts must be at least 1".to_string(),
            ));
        }
        if matches!(&self.database.url, Some(url) if url.trim().is_empty()) {
            return Err(KainosError::Config("database.url is empty".to_string()));
        }
        if self.engine.kind == EngineKind::Temporal && self.engine.temporal_url.trim().is_empty() {
            return Err(KainosError::Config(
                "engine.temporal_url is required for the temporal engine".to_string(),
            ));
        }
        if self.agent_api.base_url.trim().is_empty() {
            return Err(KainosError::Config("agent_api.base_url is required".to_string()));
        }
        Ok(())
    }

    /// Extra checks for the notifier binary
    pub fn validate_notifier(&self) -> Result<()> {
        self.validate()?;
        if !self.nats.enabled {
            return Err(KainosError::Config(
                "the notifier consumes from JetStream and needs nats.enabled".to_string(),
            ));
        }
        if self.notifier.resend_api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(KainosError::Config("notifier.resend_api_key is required".to_string()));
        }
        if !self.notifier.from_email.contains('@') {
            return Err(KainosError::Config(format!(
                "notifier.from_email '{}' is not an address",
                self.notifier.from_email
            )));
        }
        Ok(())
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            cors_enabled: self.server.cors_enabled,
        }
    }

    pub fn nats_options(&self) -> NatsOptions {
        NatsOptions {
            url: self.nats.url.clone(),
            connect_attempts: self.nats.connect_attempts,
            connect_wait: Duration::from_millis(self.nats.connect_wait_ms),
            connection_timeout: Duration::from_secs(self.nats.connection_timeout_secs),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(self.nats.reconnect_base_ms),
                max_delay: Duration::from_millis(self.nats.reconnect_max_ms),
                jitter: Duration::from_millis(self.nats.reconnect_jitter_ms),
                max_reconnects: self.nats.max_reconnects,
            },
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            task_queue: self.engine.task_queue.clone(),
            call_timeout: Duration::from_secs(self.engine.call_timeout_secs),
            run_attempts: self.engine.run_attempts,
            ..LifecycleConfig::default()
        }
    }

    pub fn agent_breaker(&self) -> BreakerSettings {
        BreakerSettings::agent_api()
            .with_failure_threshold(self.agent_api.breaker_failure_threshold)
            .with_open_timeout(Duration::from_secs(self.agent_api.breaker_open_timeout_secs))
            .with_max_half_open_requests(self.agent_api.breaker_half_open_requests)
    }

    pub fn agent_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.agent_api.retry_attempts.max(1),
            ..RetryPolicy::default()
        }
    }

    pub fn sender_identity(&self) -> SenderIdentity {
        SenderIdentity {
            from_email: self.notifier.from_email.clone(),
            from_name: self.notifier.from_name.clone(),
        }
    }
}
