// Message transport seam of the event bus

//! # Transports
//!
//! [`Transport`] is the subject-addressed pub/sub primitive the
//! [`EventBus`](super::EventBus) is built on. Payloads are raw bytes; the bus
//! owns encoding.
//!
//! [`InMemoryTransport`] follows NATS subject rules so tests exercise the same
//! routing as production:
//!
//! - tokens are separated by `.`
//! - `*` matches exactly one token
//! - `>` matches one or more trailing tokens
//! - subscribers sharing a queue group get each message round-robin

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;
use uuid::Uuid;

use crate::{KainosError, Result};

/// Prefix of reply subjects
pub const INBOX_PREFIX: &str = "_INBOX";

/// One message as seen by a subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

pub type MessageStream = BoxStream<'static, TransportMessage>;

/// Subject-addressed pub/sub
///
/// A subscription lives as long as its stream; dropping the stream
/// unsubscribes.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()>;

    /// Subscribe to a subject pattern, optionally as a queue group member
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<MessageStream>;

    /// Fresh, unique reply subject
    fn new_inbox(&self) -> String;

    async fn flush(&self) -> Result<()>;
}

/// Whether `subject` is matched by `pattern` under NATS wildcard rules
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(token)) => {
                if token.is_empty() {
                    return false;
                }
            }
            (Some(p), Some(s)) => {
                if p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscriber {
    id: u64,
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Default)]
struct Registry {
    subscribers: Vec<Subscriber>,
    /// Next member index per (pattern, queue group)
    cursors: HashMap<(String, String), usize>,
}

impl Registry {
    fn remove(&mut self, id: u64) {
        let Some(index) = self.subscribers.iter().position(|s| s.id == id) else {
            return;
        };
        let removed = self.subscribers.remove(index);
        if let Some(group) = removed.queue_group {
            let key = (removed.pattern, group);
            let members_left = self
                .subscribers
                .iter()
                .any(|s| s.pattern == key.0 && s.queue_group.as_deref() == Some(key.1.as_str()));
            if !members_left {
                self.cursors.remove(&key);
            }
        }
    }

    /// Pick the recipients of one message: every plain subscriber plus one
    /// member per queue group
    fn route(&mut self, subject: &str) -> Vec<mpsc::UnboundedSender<TransportMessage>> {
        let mut recipients = Vec::new();
        let mut groups: HashMap<(String, String), Vec<usize>> = HashMap::new();

        for (index, sub) in self.subscribers.iter().enumerate() {
            if !subject_matches(&sub.pattern, subject) {
                continue;
            }
            match &sub.queue_group {
                None => recipients.push(sub.tx.clone()),
                Some(group) => groups
                    .entry((sub.pattern.clone(), group.clone()))
                    .or_default()
                    .push(index),
            }
        }

        for (key, members) in groups {
            let cursor = self.cursors.entry(key).or_insert(0);
            let chosen = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            recipients.push(self.subscribers[chosen].tx.clone());
        }
        recipients
    }
}

/// Receiving end of an in-memory subscription; unregisters on drop
struct InMemorySubscription {
    id: u64,
    rx: UnboundedReceiverStream<TransportMessage>,
    registry: Weak<Mutex<Registry>>,
}

impl Stream for InMemorySubscription {
    type Item = TransportMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(self.id);
        }
    }
}

/// Process-local transport for tests and single-binary development
pub struct InMemoryTransport {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self {
            registry: Arc::default(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        }
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining the connection
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Queue groups with a round-robin position
    pub fn queue_group_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cursors
            .len()
    }

    /// Live subscriptions, inboxes included
    pub fn subscription_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(KainosError::NotConnected);
        }
        let recipients = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .route(subject);
        trace!("in-memory publish on {} to {} subscriber(s)", subject, recipients.len());

        let message = TransportMessage {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        };
        for tx in recipients {
            // A closed receiver is mid-drop and unregisters itself
            let _ = tx.send(message.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<MessageStream> {
        if !self.is_connected() {
            return Err(KainosError::NotConnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .push(Subscriber {
                id,
                pattern: subject.to_string(),
                queue_group: queue_group.map(str::to_string),
                tx,
            });

        Ok(Box::pin(InMemorySubscription {
            id,
            rx: UnboundedReceiverStream::new(rx),
            registry: Arc::downgrade(&self.registry),
        }))
    }

    fn new_inbox(&self) -> String {
        format!("{}.{}", INBOX_PREFIX, Uuid::new_v4().simple())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
