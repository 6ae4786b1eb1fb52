// Email notifications for bus events

//! # Notifier
//!
//! Consumes `email.send` events and delivers them through an [`EmailSender`].
//! Two kinds of email exist:
//!
//! - `welcome`: sent on onboarding, greets `info.name` (or "User")
//! - `general`: free-form message with `info.subject` (or a default subject)
//!
//! [`NotificationService`] is an [`EventHandler`], so it can sit behind a
//! plain subscription or the durable consumer. Send failures are returned to
//! the caller; on the durable path that means the message is redelivered.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bus::EventHandler;
use crate::engine::resilient::ResilientClient;
use crate::models::{EmailKind, EmailRequested, Event};
use crate::{KainosError, Result};

pub const RESEND_BASE_URL: &str = "https://api.resend.com";
pub const WELCOME_SUBJECT: &str = "Welcome to Kainos!";
pub const DEFAULT_SUBJECT: &str = "Kainos Notification";

/// A rendered email ready to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

/// Outbound email provider
#[async_trait::async_trait]
pub trait EmailSender: Send + Sync {
    /// Send one message, returning the provider's message id
    async fn send(&self, message: &EmailMessage) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

/// Resend API sender
///
/// Sending is a POST, so the client never retries it. Redelivery from the
/// durable consumer takes that role.
pub struct ResendSender {
    client: ResilientClient,
}

impl ResendSender {
    /// `client` must already point at the Resend API with a bearer token
    pub fn new(client: ResilientClient) -> Self {
        Self { client }
    }

    pub fn with_api_key(client: ResilientClient, api_key: &str) -> Result<Self> {
        let client = client.with_base_url(RESEND_BASE_URL).with_bearer_token(api_key)?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &ResilientClient {
        &self.client
    }
}

#[async_trait::async_trait]
impl EmailSender for ResendSender {
    async fn send(&self, message: &EmailMessage) -> Result<String> {
        if message.to.is_empty() {
            return Err(KainosError::InvalidInput("no recipients specified".to_string()));
        }
        let response: ResendResponse = self.client.post_json("/emails", message).await?;
        Ok(response.id)
    }
}

/// Sender that keeps messages in memory, for tests and local runs
#[derive(Default)]
pub struct InMemorySender {
    sent: Mutex<Vec<EmailMessage>>,
}

impl InMemorySender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl EmailSender for InMemorySender {
    async fn send(&self, message: &EmailMessage) -> Result<String> {
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent.push(message.clone());
        Ok(format!("local-{}", sent.len()))
    }
}

/// Sender identity on outgoing mail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub from_email: String,
    pub from_name: String,
}

impl SenderIdentity {
    /// `Name <address>`
    pub fn from_header(&self) -> String {
        format!("{} <{}>", self.from_name, self.from_email)
    }
}

/// Turns email requests into sent emails
pub struct NotificationService {
    sender: Arc<dyn EmailSender>,
    identity: SenderIdentity,
}

impl NotificationService {
    pub fn new(sender: Arc<dyn EmailSender>, identity: SenderIdentity) -> Self {
        Self { sender, identity }
    }

    /// Render the email for a request
    pub fn compose(&self, request: &EmailRequested) -> Result<EmailMessage> {
        let to = request.info.to.trim();
        if to.is_empty() {
            return Err(KainosError::InvalidEvent(
                "email request has no recipient".to_string(),
            ));
        }

        let (subject, html) = match request.kind {
            EmailKind::Welcome => {
                let name = request
                    .info
                    .name
                    .as_deref()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or("User");
                let html = render_template(
                    &format!("Welcome {}!", name),
                    &request.message,
                    WELCOME_BLOCK,
                );
                (WELCOME_SUBJECT.to_string(), html)
            }
            EmailKind::General => {
                let subject = request
                    .info
                    .subject
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());
                (subject, render_template("Notification", &request.message, ""))
            }
        };

        Ok(EmailMessage {
            from: self.identity.from_header(),
            to: vec![to.to_string()],
            subject,
            html,
        })
    }

    pub async fn notify(&self, request: &EmailRequested) -> Result<String> {
        let message = self.compose(request)?;
        let id = self.sender.send(&message).await?;
        info!("📧 {:?} email sent to {} (id {})", request.kind, message.to.join(","), id);
        Ok(id)
    }
}

#[async_trait::async_trait]
impl EventHandler for NotificationService {
    async fn handle(&self, event: Event) -> Result<()> {
        let request: EmailRequested = event.decode()?;
        if let Err(e) = self.notify(&request).await {
            warn!("Email for event {} not sent: {}", event.id, e);
            return Err(e);
        }
        Ok(())
    }
}

const WELCOME_BLOCK: &str = r#"<div style="text-align: center; margin: 20px 0;">
  <p style="font-size: 18px; color: #333;">Thank you for joining us at Kainos!</p>
  <p style="color: #666;">We're excited to have you on board and look forward to working with you.</p>
</div>"#;

/// Escape text for inclusion in HTML
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Branded HTML layout; `title` and `message` are escaped, `extra` is trusted
pub fn render_template(title: &str, message: &str, extra: &str) -> String {
    let title = escape_html(title);
    let message = escape_html(message);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>{title}</title>
</head>
<body style="margin: 0; padding: 0; font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif; background: #f4f6fb;">
  <div style="max-width: 600px; margin: 0 auto; background: #ffffff; border-radius: 10px; overflow: hidden;">
    <div style="background: linear-gradient(135deg, #00d4ff 0%, #0099cc 100%); padding: 30px 20px; text-align: center;">
      <h1 style="color: #ffffff; font-size: 36px; letter-spacing: 2px; margin: 0;">KAINOS</h1>
    </div>
    <div style="padding: 40px 30px;">
      <h2 style="color: #2c3e50; font-size: 28px; text-align: center;">{title}</h2>
      <div style="color: #34495e; font-size: 16px; line-height: 1.8; text-align: center;">{message}</div>
      {extra}
    </div>
    <div style="background: #f8f9fa; padding: 25px 20px; text-align: center; border-top: 1px solid #dee2e6;">
      <p style="color: #6c757d; font-size: 14px;">You are receiving this email because you have a Kainos account.</p>
    </div>
  </div>
</body>
</html>"#
    )
}
