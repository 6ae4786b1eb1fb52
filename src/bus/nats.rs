// NATS transport

//! # NATS Transport
//!
//! [`NatsTransport`] adapts an `async_nats::Client` to [`Transport`].
//!
//! Connection handling:
//! - the initial connect is retried `connect_attempts` times with a linear
//!   wait (`attempt * connect_wait`)
//! - once connected, the client reconnects on its own following
//!   [`ReconnectPolicy`]: exponential backoff capped at `max_delay`, plus up
//!   to `jitter` of random delay, giving up after `max_reconnects`
//! - connection events are logged

use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event};
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use tracing::{error, info, warn};

use super::transport::{MessageStream, Transport, TransportMessage};
use crate::{KainosError, Result};

/// Client name reported to the server
pub const CLIENT_NAME: &str = "kainos-core-api";

/// Automatic reconnect behavior after the first successful connect
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    /// `None` retries forever
    pub max_reconnects: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(100),
            max_reconnects: Some(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempts` (1-based), without jitter
    pub fn base_backoff(&self, attempts: usize) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    pub fn delay(&self, attempts: usize) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_backoff(attempts) + jitter
    }
}

/// Connection parameters for [`NatsTransport::connect_with_retry`]
#[derive(Debug, Clone)]
pub struct NatsOptions {
    pub url: String,
    pub connect_attempts: u32,
    pub connect_wait: Duration,
    pub connection_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            connect_attempts: 10,
            connect_wait: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// [`Transport`] over a NATS connection
#[derive(Clone)]
pub struct NatsTransport {
    client: Client,
}

impl NatsTransport {
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn options(options: &NatsOptions) -> ConnectOptions {
        let policy = options.reconnect.clone();
        ConnectOptions::new()
            .name(CLIENT_NAME)
            .connection_timeout(options.connection_timeout)
            .max_reconnects(policy.max_reconnects)
            .reconnect_delay_callback(move |attempts| policy.delay(attempts))
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("🔌 NATS connected"),
                    Event::Disconnected => warn!("⚠️ NATS disconnected, reconnecting"),
                    Event::ServerError(e) => error!("❌ NATS server error: {}", e),
                    Event::ClientError(e) => error!("❌ NATS client error: {}", e),
                    other => warn!("NATS event: {}", other),
                }
            })
    }

    /// Connect, retrying the first connection with a linear wait
    pub async fn connect_with_retry(options: &NatsOptions) -> Result<Self> {
        let attempts = options.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Self::options(options).connect(options.url.as_str()).await {
                Ok(client) => {
                    info!("✅ Connected to NATS at {} (attempt {})", options.url, attempt);
                    return Ok(Self { client });
                }
                Err(e) => {
                    warn!(
                        "NATS connect attempt {}/{} to {} failed: {}",
                        attempt, attempts, options.url, e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(options.connect_wait * attempt).await;
                    }
                }
            }
        }

        Err(KainosError::Bus(format!(
            "could not connect to NATS at {} after {} attempts: {}",
            options.url, attempts, last_error
        )))
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(KainosError::NotConnected);
        }
        let published = match reply {
            Some(reply) => {
                self.client
                    .publish_with_reply(subject.to_string(), reply.to_string(), payload)
                    .await
            }
            None => self.client.publish(subject.to_string(), payload).await,
        };
        published.map_err(|e| KainosError::Bus(format!("publish to {} failed: {}", subject, e)))
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<MessageStream> {
        let subscriber = match queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(subject.to_string(), group.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| KainosError::Bus(format!("subscribe to {} failed: {}", subject, e)))?;

        Ok(subscriber
            .filter_map(|message| async move {
                if message.status.is_some() {
                    return None;
                }
                Some(TransportMessage {
                    subject: message.subject.to_string(),
                    reply: message.reply.map(|r| r.to_string()),
                    payload: message.payload,
                })
            })
            .boxed())
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| KainosError::Bus(format!("flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
            max_reconnects: Some(10),
        };
        assert_eq!(policy.base_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.base_backoff(4), Duration::from_millis(800));
        assert_eq!(policy.base_backoff(5), Duration::from_secs(1));
        assert_eq!(policy.base_backoff(500), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..20 {
            let delay = policy.delay(attempt);
            assert!(delay >= policy.base_backoff(attempt));
            assert!(delay <= policy.base_backoff(attempt) + policy.jitter);
        }
    }

    #[test]
    fn test_default_reconnects_are_finite() {
        assert!(ReconnectPolicy::default().max_reconnects.is_some());
    }

    #[tokio::test]
    async fn test_connect_gives_up() {
        let options = NatsOptions {
            url: "nats://127.0.0.1:1".to_string(),
            connect_attempts: 2,
            connect_wait: Duration::from_millis(10),
            connection_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let err = NatsTransport::connect_with_retry(&options).await.err().unwrap();
        assert!(matches!(err, KainosError::Bus(_)));
    }
}
