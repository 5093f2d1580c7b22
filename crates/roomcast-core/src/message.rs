//! Event messages fanned out to rooms.
//!
//! A [`Message`] is an immutable value that is serialized exactly once per
//! publish and shared by every recipient.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::room::PRESENCE;

/// Event type published by a session when a user's first presence connection opens.
pub const ONLINE: &str = "online";

/// Event type published when a user's last presence connection closes or expires.
pub const OFFLINE: &str = "offline";

/// Event type for inbound text frames relayed back into the sender's room.
pub const ECHO: &str = "echo";

/// Message errors.
#[derive(Debug, Error)]
pub enum MessageError {
    /// Payload or envelope could not be turned into JSON.
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Current unix time in whole seconds.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// A single event published to a room.
///
/// Wire shape: `{"type", "room", "from"?, "at", "payload"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Event type tag, e.g. `comment_created`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Room the event was published to.
    pub room: String,
    /// Originating user, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Unix seconds at construction.
    pub at: i64,
    /// Opaque event body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    /// Create a message with no originator and no payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            room: room.into(),
            from: None,
            at: unix_now(),
            payload: None,
        }
    }

    /// Set the originating user.
    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Attach an already-built JSON payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns an error if `payload` cannot be represented as JSON.
    pub fn with_serialized<T: Serialize + ?Sized>(self, payload: &T) -> Result<Self, MessageError> {
        Ok(self.with_payload(serde_json::to_value(payload)?))
    }

    /// Synthetic presence event for a user coming online.
    #[must_use]
    pub fn online(user_id: &str) -> Self {
        Self::new(ONLINE, PRESENCE).with_payload(serde_json::json!({ "userId": user_id }))
    }

    /// Synthetic presence event for a user going offline.
    #[must_use]
    pub fn offline(user_id: &str) -> Self {
        Self::new(OFFLINE, PRESENCE).with_payload(serde_json::json!({ "userId": user_id }))
    }

    /// Relay of an inbound text frame.
    #[must_use]
    pub fn echo(room: impl Into<String>, from: Option<&str>, text: impl Into<String>) -> Self {
        let mut message = Self::new(ECHO, room).with_payload(Value::String(text.into()));
        message.from = from.map(str::to_string);
        message
    }

    /// Serialize into the wire representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload contains values JSON cannot hold.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}
