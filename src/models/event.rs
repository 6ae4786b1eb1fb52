// Domain events carried over the message bus
// Wire format: {id, type, timestamp, source, data}

//! # Events
//!
//! An [`Event`] is the unit the event distribution layer moves around. On the
//! wire it is a JSON object with an RFC3339 timestamp and a free-form `data`
//! object. Inside the process, consumers never poke at `data` by hand: every
//! event type has a typed payload implementing [`EventData`], and
//! [`Event::decode`] checks the type tag before deserialising.
//!
//! ## Subjects
//!
//! - `user.created`, `user.updated`, `user.deleted`: tenant lifecycle
//! - `email.send`: notification requests for the notifier service
//! - `error`: reply type used by request/reply responders that failed

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{KainosError, Result};

/// Ordered map of payload fields
pub type EventPayload = Map<String, Value>;

/// Event type used for error replies
pub const ERROR_EVENT_TYPE: &str = "error";

/// A domain event, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub data: EventPayload,
}

/// Typed payload for one event type
///
/// ## Rust Learning Notes:
///
/// ### Associated Constants
/// `EVENT_TYPE` is resolved at compile time, so `Event::decode::<UserCreated>()`
/// knows which tag to expect without any runtime registry.
pub trait EventData: Serialize + DeserializeOwned {
    /// Value of the `type` field for this payload
    const EVENT_TYPE: &'static str;

    /// Subject the payload is published on (same as the type by default)
    fn subject() -> &'static str {
        Self::EVENT_TYPE
    }
}

impl Event {
    /// Build an event with a fresh id and the current timestamp
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            data,
        }
    }

    /// Build an event from a typed payload
    pub fn from_data<T: EventData>(source: impl Into<String>, payload: &T) -> Result<Self> {
        match serde_json::to_value(payload)? {
            Value::Object(data) => Ok(Self::new(T::EVENT_TYPE, source, data)),
            other => Err(KainosError::InvalidEvent(format!(
                "payload for '{}' must serialize to an object, got {}",
                T::EVENT_TYPE,
                other
            ))),
        }
    }

    /// Decode the typed payload, checking the type tag first
    pub fn decode<T: EventData>(&self) -> Result<T> {
        if self.event_type != T::EVENT_TYPE {
            return Err(KainosError::InvalidEvent(format!(
                "expected event type '{}', got '{}'",
                T::EVENT_TYPE,
                self.event_type
            )));
        }
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| {
            KainosError::InvalidEvent(format!("malformed '{}' payload: {}", self.event_type, e))
        })
    }

    /// Error reply sent back by a failing responder
    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        let mut data = EventPayload::new();
        data.insert("error".to_string(), Value::String(message.into()));
        Self::new(ERROR_EVENT_TYPE, source, data)
    }

    pub fn is_error(&self) -> bool {
        self.event_type == ERROR_EVENT_TYPE
    }

    /// Message carried by an error reply
    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.data.get("error").and_then(Value::as_str)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| KainosError::InvalidEvent(format!("undecodable event: {}", e)))
    }
}

/// A tenant was onboarded from an identity-provider webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCreated {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
}

impl EventData for UserCreated {
    const EVENT_TYPE: &'static str = "user.created";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserUpdated {
    pub user_id: String,
    pub email: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
}

impl EventData for UserUpdated {
    const EVENT_TYPE: &'static str = "user.updated";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDeleted {
    pub user_id: String,
}

impl EventData for UserDeleted {
    const EVENT_TYPE: &'static str = "user.deleted";
}

/// Kind of email the notifier should render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailKind {
    Welcome,
    General,
}

/// Recipient details of an email request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailInfo {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Request for the notifier to send an email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRequested {
    #[serde(rename = "type")]
    pub kind: EmailKind,
    pub message: String,
    pub info: EmailInfo,
}

impl EventData for EmailRequested {
    const EVENT_TYPE: &'static str = "email.send";
}

impl EmailRequested {
    pub fn welcome(to: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: EmailKind::Welcome,
            message: "Your account is ready. Your workflows are waiting for you.".to_string(),
            info: EmailInfo {
                to: to.into(),
                name: Some(name.into()),
                subject: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}

impl EventData for ErrorReply {
    const EVENT_TYPE: &'static str = ERROR_EVENT_TYPE;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> UserCreated {
        UserCreated {
            user_id: "user_2abc".to_string(),
            email: "ada@example.com".to_string(),
            name: "Ada Lovelace".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        }
    }

    #[test]
    fn test_wire_format_field_names() {
        let event = Event::from_data("core-api", &sample_user()).unwrap();
        let json: Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();

        assert_eq!(json["type"], "user.created");
        assert_eq!(json["source"], "core-api");
        assert_eq!(json["data"]["email"], "ada@example.com");
        assert!(json["id"].as_str().is_some());
        // RFC3339 timestamps parse back
        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_decode_checks_type_tag() {
        let event = Event::from_data("core-api", &sample_user()).unwrap();
        assert_eq!(event.decode::<UserCreated>().unwrap(), sample_user());

        let err = event.decode::<UserDeleted>().unwrap_err();
        assert!(matches!(err, KainosError::InvalidEvent(_)));
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let mut data = EventPayload::new();
        data.insert("type".to_string(), Value::String("welcome".to_string()));
        // message and info are missing
        let event = Event::new("email.send", "test", data);
        assert!(matches!(
            event.decode::<EmailRequested>(),
            Err(KainosError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_payload_preserves_field_order() {
        let event = Event::from_data("core-api", &sample_user()).unwrap();
        let keys: Vec<&str> = event.data.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["user_id", "email", "name", "first_name", "last_name"]);
    }

    #[test]
    fn test_error_event() {
        let event = Event::error("email-service", "mailbox full");
        assert!(event.is_error());
        assert_eq!(event.error_message(), Some("mailbox full"));
        assert_eq!(event.decode::<ErrorReply>().unwrap().error, "mailbox full");
    }

    #[test]
    fn test_email_request_wire_shape() {
        let request = EmailRequested::welcome("ada@example.com", "Ada");
        let event = Event::from_data("core-api", &request).unwrap();
        assert_eq!(event.data["type"], "welcome");
        assert_eq!(event.data["info"]["to"], "ada@example.com");
        assert!(event.data["info"].get("subject").is_none());
    }
}
