// Identity-provider webhook signatures

//! # Webhook Verification
//!
//! The identity provider signs webhooks the Svix way:
//!
//! - `svix-id`: message id
//! - `svix-timestamp`: unix seconds
//! - `svix-signature`: space-separated `v1,<base64 HMAC-SHA256>` entries
//!
//! The signed content is `"{id}.{timestamp}.{body}"` and the key is the
//! base64 part of a `whsec_` secret. Timestamps further than
//! [`DEFAULT_TOLERANCE`] from now are rejected.

use std::time::Duration;

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::hmac;

use crate::{KainosError, Result};

pub const SECRET_PREFIX: &str = "whsec_";
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5 * 60);

pub const ID_HEADER: &str = "svix-id";
pub const TIMESTAMP_HEADER: &str = "svix-timestamp";
pub const SIGNATURE_HEADER: &str = "svix-signature";

/// HMAC key for one webhook endpoint
pub struct WebhookVerifier {
    key: hmac::Key,
    tolerance: Duration,
}

impl WebhookVerifier {
    /// Build from a `whsec_...` secret (the prefix is optional)
    pub fn from_secret(secret: &str) -> Result<Self> {
        let encoded = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| KainosError::Config(format!("webhook secret is not base64: {}", e)))?;
        if bytes.is_empty() {
            return Err(KainosError::Config("webhook secret is empty".to_string()));
        }
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, &bytes),
            tolerance: DEFAULT_TOLERANCE,
        })
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn signed_content(id: &str, timestamp: &str, body: &[u8]) -> Vec<u8> {
        let mut content = Vec::with_capacity(id.len() + timestamp.len() + body.len() + 2);
        content.extend_from_slice(id.as_bytes());
        content.push(b'.');
        content.extend_from_slice(timestamp.as_bytes());
        content.push(b'.');
        content.extend_from_slice(body);
        content
    }

    /// `v1,<signature>` for a message
    pub fn sign(&self, id: &str, timestamp: i64, body: &[u8]) -> String {
        let content = Self::signed_content(id, &timestamp.to_string(), body);
        let tag = hmac::sign(&self.key, &content);
        format!("v1,{}", BASE64.encode(tag.as_ref()))
    }

    /// Check headers and body against the key at time `now` (unix seconds)
    pub fn verify(&self, headers: &HeaderMap, body: &[u8], now: i64) -> Result<()> {
        let id = header(headers, ID_HEADER)?;
        let timestamp = header(headers, TIMESTAMP_HEADER)?;
        let signatures = header(headers, SIGNATURE_HEADER)?;

        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| KainosError::Unauthorized("invalid webhook timestamp".to_string()))?;
        if now.abs_diff(sent_at) > self.tolerance.as_secs() {
            return Err(KainosError::Unauthorized(
                "webhook timestamp outside tolerance".to_string(),
            ));
        }

        let content = Self::signed_content(id, timestamp, body);
        let matched = signatures
            .split_whitespace()
            .filter_map(|entry| entry.strip_prefix("v1,"))
            .filter_map(|sig| BASE64.decode(sig).ok())
            .any(|sig| hmac::verify(&self.key, &content, &sig).is_ok());

        if matched {
            Ok(())
        } else {
            Err(KainosError::Unauthorized("webhook signature mismatch".to_string()))
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| KainosError::Unauthorized(format!("missing {} header", name)))
}
