// JetStream durable consumer

//! # Durable Consumer
//!
//! At-least-once delivery for subjects that must not lose messages (the
//! notifier's `email.>`). Messages published on core NATS are captured by a
//! JetStream stream and pulled by a durable consumer with explicit acks:
//!
//! | Outcome                         | Ack   |
//! |---------------------------------|-------|
//! | handler returned `Ok`           | ack   |
//! | handler returned an error       | nak (redelivered) |
//! | payload is not a valid event    | term (never redelivered) |
//!
//! A handler rejecting the payload with `InvalidEvent` is treated like an
//! undecodable message, since redelivery cannot fix it.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream, AckKind};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::EventHandler;
use crate::models::Event;
use crate::{KainosError, Result};

pub const EMAIL_STREAM: &str = "event_email";
pub const EMAIL_SUBJECTS: &str = "email.>";
pub const EMAIL_CONSUMER: &str = "email-consumer";

/// Stream and consumer a [`DurableConsumer`] binds to
#[derive(Debug, Clone, PartialEq)]
pub struct DurableConfig {
    pub stream: String,
    pub subjects: Vec<String>,
    pub consumer: String,
    pub max_age: Duration,
    /// Deliveries per message before the server gives up; -1 is unlimited
    pub max_deliver: i64,
    pub ack_wait: Duration,
}

impl DurableConfig {
    /// The notifier's email stream
    pub fn email() -> Self {
        Self {
            stream: EMAIL_STREAM.to_string(),
            subjects: vec![EMAIL_SUBJECTS.to_string()],
            consumer: EMAIL_CONSUMER.to_string(),
            max_age: Duration::from_secs(24 * 60 * 60),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
        }
    }

    pub fn stream_config(&self) -> stream::Config {
        stream::Config {
            name: self.stream.clone(),
            subjects: self.subjects.clone(),
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::Limits,
            max_age: self.max_age,
            num_replicas: 1,
            ..Default::default()
        }
    }

    pub fn consumer_config(&self) -> consumer::pull::Config {
        consumer::pull::Config {
            durable_name: Some(self.consumer.clone()),
            ack_policy: consumer::AckPolicy::Explicit,
            deliver_policy: consumer::DeliverPolicy::All,
            max_deliver: self.max_deliver,
            ack_wait: self.ack_wait,
            ..Default::default()
        }
    }
}

/// How a delivered message is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Nak,
    Term,
}

/// Decode and handle one payload, deciding how to settle it
pub async fn process(handler: &dyn EventHandler, payload: &[u8]) -> AckDecision {
    let event = match Event::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("🗑️ Terminating undecodable message: {}", e);
            return AckDecision::Term;
        }
    };
    let id = event.id.clone();
    let outcome = handler.handle(event).await;
    let decision = ack_decision(&outcome);
    if let Err(e) = &outcome {
        match decision {
            AckDecision::Term => warn!("🗑️ Terminating event {}: {}", id, e),
            _ => warn!("🔁 Event {} failed, requesting redelivery: {}", id, e),
        }
    }
    decision
}

pub fn ack_decision(outcome: &Result<()>) -> AckDecision {
    match outcome {
        Ok(()) => AckDecision::Ack,
        Err(KainosError::InvalidEvent(_)) => AckDecision::Term,
        Err(_) => AckDecision::Nak,
    }
}

/// Pull consumer over a JetStream stream
pub struct DurableConsumer {
    jetstream: jetstream::Context,
    config: DurableConfig,
    cancel: CancellationToken,
}

impl DurableConsumer {
    pub fn new(client: async_nats::Client, config: DurableConfig) -> Self {
        Self {
            jetstream: jetstream::new(client),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DurableConfig {
        &self.config
    }

    /// Create the stream if it does not exist yet
    pub async fn ensure_stream(&self) -> Result<stream::Stream> {
        let stream = self
            .jetstream
            .get_or_create_stream(self.config.stream_config())
            .await
            .map_err(|e| KainosError::Bus(format!("stream {}: {}", self.config.stream, e)))?;
        info!("✅ JetStream stream {} ready", self.config.stream);
        Ok(stream)
    }

    async fn ensure_consumer(&self) -> Result<consumer::Consumer<consumer::pull::Config>> {
        let stream = self.ensure_stream().await?;
        let consumer = stream
            .get_or_create_consumer(&self.config.consumer, self.config.consumer_config())
            .await
            .map_err(|e| KainosError::Bus(format!("consumer {}: {}", self.config.consumer, e)))?;
        info!("✅ Durable consumer {} ready", self.config.consumer);
        Ok(consumer)
    }

    /// Pull and settle messages until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let consumer = self.ensure_consumer().await?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| KainosError::Bus(format!("consumer {} stream: {}", self.config.consumer, e)))?;
        info!("📥 Consuming {} from {}", self.config.subjects.join(","), self.config.stream);

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = messages.next() => next,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    error!("❌ Pull from {} failed: {}", self.config.consumer, e);
                    continue;
                }
                None => break,
            };

            let settled = match process(handler.as_ref(), &message.payload).await {
                AckDecision::Ack => message.ack().await,
                AckDecision::Nak => message.ack_with(AckKind::Nak(None)).await,
                AckDecision::Term => message.ack_with(AckKind::Term).await,
            };
            if let Err(e) = settled {
                error!("❌ Failed to settle message on {}: {}", message.subject, e);
            }
        }

        debug!("durable consumer {} stopped", self.config.consumer);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use crate::models::{EmailRequested, EventData};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_email_stream_settings() {
        let config = DurableConfig::email();
        let stream = config.stream_config();
        assert_eq!(stream.name, "event_email");
        assert_eq!(stream.subjects, vec!["email.>".to_string()]);
        assert_eq!(stream.max_age, Duration::from_secs(86_400));
        assert!(matches!(stream.storage, stream::StorageType::File));

        let consumer = config.consumer_config();
        assert_eq!(consumer.durable_name.as_deref(), Some("email-consumer"));
        assert!(matches!(consumer.ack_policy, consumer::AckPolicy::Explicit));
    }

    #[tokio::test]
    async fn test_settlement() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = handler_fn(move |event: Event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                let request: EmailRequested = event.decode()?;
                if request.info.to.ends_with("@bounce.test") {
                    return Err(KainosError::Upstream {
                        status: 503,
                        body: "try later".to_string(),
                    });
                }
                Ok(())
            }
        });

        let ok = Event::from_data("core-api", &EmailRequested::welcome("a@b.test", "Ada")).unwrap();
        assert_eq!(process(handler.as_ref(), &ok.to_bytes().unwrap()).await, AckDecision::Ack);

        let bounce =
            Event::from_data("core-api", &EmailRequested::welcome("x@bounce.test", "X")).unwrap();
        assert_eq!(process(handler.as_ref(), &bounce.to_bytes().unwrap()).await, AckDecision::Nak);

        let wrong_type = Event::new("user.created", "core-api", Default::default());
        assert_eq!(
            process(handler.as_ref(), &wrong_type.to_bytes().unwrap()).await,
            AckDecision::Term
        );

        assert_eq!(process(handler.as_ref(), b"not json").await, AckDecision::Term);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(EmailRequested::EVENT_TYPE, "email.send");
    }
}
