// Event distribution layer

//! # Event Bus
//!
//! [`EventBus`] moves [`Event`]s between services over a [`Transport`]:
//!
//! - `publish`: fire-and-forget; fails fast when the transport is down
//! - `subscribe` / `queue_subscribe`: one dispatcher task per subscription,
//!   one handler task per message
//! - `request`: publish with a private inbox and wait for the first reply
//! - `subscribe_with_reply`: answer requests with the handler's event
//! - [`durable::DurableConsumer`]: at-least-once delivery with explicit acks
//!
//! Handlers run concurrently; there is no ordering guarantee between
//! messages of one subscription.

pub mod durable;
pub mod nats;
pub mod transport;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{Event, EventData};
use crate::{KainosError, Result};
use transport::{MessageStream, Transport};

/// Value of `source` on events this service emits
pub const DEFAULT_SOURCE: &str = "core-api";

/// Consumer of delivered events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Responder for request/reply subjects
#[async_trait::async_trait]
pub trait ReplyHandler: Send + Sync {
    async fn reply(&self, event: Event) -> Result<Event>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: Event) -> Result<()> {
        (self.0)(event).await
    }
}

/// Adapter turning an async closure into a [`ReplyHandler`]
pub struct FnReplyHandler<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> ReplyHandler for FnReplyHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Event>> + Send,
{
    async fn reply(&self, event: Event) -> Result<Event> {
        (self.0)(event).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

pub fn reply_fn<F, Fut>(f: F) -> Arc<dyn ReplyHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Event>> + Send + 'static,
{
    Arc::new(FnReplyHandler(f))
}

/// A live subscription owned by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub subject: String,
    pub queue_group: Option<String>,
    pub replies: bool,
}

/// Publishes and routes events over a transport
///
/// ## Rust Learning Notes:
///
/// ### Cancellation Tokens
/// Every dispatcher task gets a child of one root `CancellationToken`.
/// `shutdown()` cancels the root, which stops all dispatchers at their next
/// `select!` without having to keep their `JoinHandle`s around.
#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn Transport>,
    source: String,
    subscriptions: Arc<Mutex<Vec<SubscriptionInfo>>>,
    shutdown: Arc<Mutex<CancellationToken>>,
}

impl EventBus {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            source: DEFAULT_SOURCE.to_string(),
            subscriptions: Arc::default(),
            shutdown: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Override the `source` stamped on emitted events
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish an event; nothing is buffered while disconnected
    pub async fn publish(&self, subject: &str, event: &Event) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(KainosError::NotConnected);
        }
        let payload = Bytes::from(event.to_bytes()?);
        self.transport.publish(subject, None, payload).await?;
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            subject = %subject,
            "📤 Event published"
        );
        Ok(())
    }

    /// Wrap a typed payload in an event and publish it on its own subject
    pub async fn emit<T: EventData>(&self, payload: &T) -> Result<Event> {
        let event = Event::from_data(self.source.clone(), payload)?;
        self.publish(T::subject(), &event).await?;
        Ok(event)
    }

    pub async fn subscribe(&self, subject: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        let stream = self.transport.subscribe(subject, None).await?;
        self.register(subject, None, false);
        self.spawn_dispatcher(subject.to_string(), stream, handler);
        info!("📥 Subscribed to {}", subject);
        Ok(())
    }

    /// Compete with other members of `group` for each message
    pub async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let stream = self.transport.subscribe(subject, Some(group)).await?;
        self.register(subject, Some(group), false);
        self.spawn_dispatcher(subject.to_string(), stream, handler);
        info!("📥 Queue-subscribed to {} as {}", subject, group);
        Ok(())
    }

    /// Send a request and wait for the first reply
    ///
    /// Waits exactly `timeout` when nobody answers. The inbox subscription is
    /// dropped when this returns, whatever the outcome.
    pub async fn request(&self, subject: &str, event: &Event, timeout: Duration) -> Result<Event> {
        if !self.transport.is_connected() {
            return Err(KainosError::NotConnected);
        }
        let inbox = self.transport.new_inbox();
        let mut replies = self.transport.subscribe(&inbox, None).await?;
        let payload = Bytes::from(event.to_bytes()?);
        self.transport.publish(subject, Some(&inbox), payload).await?;
        debug!("request {} on {} waiting on {}", event.id, subject, inbox);

        let message = tokio::time::timeout(timeout, replies.next())
            .await
            .map_err(|_| KainosError::Timeout {
                operation: format!("request on {}", subject),
                after: timeout,
            })?
            .ok_or_else(|| KainosError::Bus(format!("reply inbox for {} closed", subject)))?;

        let reply = Event::from_slice(&message.payload)?;
        if reply.is_error() {
            let message = reply.error_message().unwrap_or("unknown error").to_string();
            return Err(KainosError::Remote(message));
        }
        Ok(reply)
    }

    /// Answer requests on `subject` with the handler's event
    ///
    /// A handler error is sent back as an `error` event so the requester
    /// fails fast instead of timing out.
    pub async fn subscribe_with_reply(&self, subject: &str, handler: Arc<dyn ReplyHandler>) -> Result<()> {
        let mut stream = self.transport.subscribe(subject, None).await?;
        self.register(subject, None, true);

        let token = self.child_token();
        let transport = self.transport.clone();
        let source = self.source.clone();
        let subject = subject.to_string();
        info!("📥 Replying on {}", subject);

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };

                let Some(reply_to) = message.reply.clone() else {
                    warn!("Dropping message on {} without a reply subject", subject);
                    continue;
                };
                let handler = handler.clone();
                let transport = transport.clone();
                let source = source.clone();

                tokio::spawn(async move {
                    let answer = match Event::from_slice(&message.payload) {
                        Ok(event) => handler
                            .reply(event)
                            .await
                            .unwrap_or_else(|e| Event::error(source.clone(), e.to_string())),
                        Err(e) => Event::error(source.clone(), e.to_string()),
                    };
                    let sent = match answer.to_bytes() {
                        Ok(bytes) => transport.publish(&reply_to, None, Bytes::from(bytes)).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        error!("❌ Failed to reply on {}: {}", reply_to, e);
                    }
                });
            }
            debug!("reply dispatcher for {} stopped", subject);
        });
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.transport.flush().await
    }

    /// Stop every dispatcher and forget all subscriptions
    pub fn shutdown(&self) {
        let mut token = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("🛑 Event bus subscriptions shut down");
    }

    fn child_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token()
    }

    fn register(&self, subject: &str, queue_group: Option<&str>, replies: bool) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SubscriptionInfo {
                subject: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                replies,
            });
    }

    fn spawn_dispatcher(&self, subject: String, mut stream: MessageStream, handler: Arc<dyn EventHandler>) {
        let token = self.child_token();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };

                let event = match Event::from_slice(&message.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Dropping undecodable message on {}: {}", message.subject, e);
                        continue;
                    }
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let id = event.id.clone();
                    if let Err(e) = handler.handle(event).await {
                        error!("❌ Handler for event {} failed: {}", id, e);
                    }
                });
            }
            debug!("dispatcher for {} stopped", subject);
        });
    }
}

#[cfg(test)]
mod bus_tests;
