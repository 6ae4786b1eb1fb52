// Kainos Notifier
// Durable consumer of email.* events, delivered through Resend
// Run with: cargo run --bin notifier

//! # Kainos Notifier Binary
//!
//! Binds the `email-consumer` durable consumer on the `event_email` stream and
//! hands each event to a [`NotificationService`]. A send failure naks the
//! message so JetStream redelivers it; an undecodable or invalid request is
//! terminated.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dotenv::dotenv;
use tracing::{error, info, warn};

use kainos::bus::durable::{DurableConfig, DurableConsumer};
use kainos::bus::nats::NatsTransport;
use kainos::engine::{BreakerSettings, CircuitBreaker, ResilientClient, RetryPolicy};
use kainos::notifier::{NotificationService, ResendSender};
use kainos::server::init_tracing;
use kainos::{AppConfig, KainosError};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv_result = dotenv();
    init_tracing("info");
    if let Err(e) = dotenv_result {
        warn!("No .env file loaded: {}", e);
    }

    info!("📧 Starting Kainos Notifier...");
    let config = AppConfig::load()?;
    config.validate_notifier()?;

    let api_key = config
        .notifier
        .resend_api_key
        .clone()
        .ok_or_else(|| KainosError::Config("notifier.resend_api_key is required".to_string()))?;
    let breaker = Arc::new(CircuitBreaker::new(BreakerSettings::new("resend")));
    let client = ResilientClient::new(breaker, Duration::from_secs(config.notifier.timeout_secs))?
        .with_base_url(config.notifier.resend_base_url.clone())
        .with_bearer_token(&api_key)?
        .with_retry_policy(RetryPolicy::none());
    let service = Arc::new(NotificationService::new(
        Arc::new(ResendSender::new(client)),
        config.sender_identity(),
    ));
    info!(
        "✅ Sending as {}",
        config.sender_identity().from_header()
    );

    let transport = NatsTransport::connect_with_retry(&config.nats_options()).await?;
    let consumer = Arc::new(DurableConsumer::new(
        transport.client().clone(),
        DurableConfig::email(),
    ));
    consumer.ensure_stream().await?;

    let runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(service).await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("🛑 Shutdown requested");
            consumer.shutdown();
        }
        Err(e) => error!("❌ Failed to listen for Ctrl-C, running until the consumer stops: {}", e),
    }

    match runner.await {
        Ok(result) => result?,
        Err(e) => error!("❌ Consumer task ended abnormally: {}", e),
    }
    if let Err(e) = transport.client().flush().await {
        warn!("NATS flush on shutdown failed: {}", e);
    }
    info!("👋 Notifier stopped");
    Ok(())
}
