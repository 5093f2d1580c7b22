//! Room registry and fan-out.
//!
//! The hub maps room names to the connections currently joined to them.
//! Rooms come into existence on first join and disappear when the last
//! member leaves.

use crate::connection::{Connection, ConnectionId};
use crate::message::{Message, MessageError};
use crate::room::RoomId;
use crate::telemetry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

type Members = HashMap<ConnectionId, Arc<dyn Connection>>;

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Members the frame was queued for.
    pub delivered: usize,
    /// Members whose send failed.
    pub failed: usize,
}

impl PublishReport {
    /// Number of members the publish saw.
    #[must_use]
    pub fn recipients(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Sum of member counts over all rooms.
    pub total_memberships: usize,
}

/// The room registry.
///
/// Every structural change to a room happens under that room's shard lock,
/// and a publish holds the shard's read guard for the whole fan-out. Sends
/// only enqueue, so the guard is never held across I/O.
#[derive(Default)]
pub struct Hub {
    rooms: DashMap<RoomId, Members>,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        info!("Creating hub");
        Self::default()
    }

    /// Add a connection to a room, creating the room if needed.
    ///
    /// Joining twice is a no-op.
    pub fn join(&self, room: &str, connection: Arc<dyn Connection>) {
        let mut members = self.rooms.entry(room.to_string()).or_insert_with(|| {
            debug!(room = %room, "Creating room");
            HashMap::new()
        });

        let id = connection.id().clone();
        if members.insert(id.clone(), connection).is_none() {
            debug!(room = %room, connection = %id, members = members.len(), "Joined");
        }
    }

    /// Remove a connection from a room, deleting the room once empty.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&self, room: &str, connection_id: &ConnectionId) -> bool {
        let removed = self
            .rooms
            .get_mut(room)
            .map(|mut members| members.remove(connection_id).is_some())
            .unwrap_or(false);

        if removed {
            debug!(room = %room, connection = %connection_id, "Left");
            if self.rooms.remove_if(room, |_, members| members.is_empty()).is_some() {
                debug!(room = %room, "Deleted empty room");
            }
        }

        removed
    }

    /// Fan a message out to every member of its room.
    ///
    /// The message is serialized once. A failing member is logged and
    /// skipped; it stays joined until its own session leaves.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    pub fn publish_message(&self, message: &Message) -> Result<PublishReport, MessageError> {
        let room = message.room.as_str();
        if !self.rooms.contains_key(room) {
            trace!(room = %room, kind = %message.kind, "Publish to empty room");
            let report = PublishReport::default();
            telemetry::record_publish(&report);
            return Ok(report);
        }

        let frame = message.encode()?;
        let mut report = PublishReport::default();

        if let Some(members) = self.rooms.get(room) {
            for (id, connection) in members.iter() {
                match connection.send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(room = %room, connection = %id, error = %e, "Delivery failed");
                        report.failed += 1;
                    }
                }
            }
        }

        trace!(
            room = %room,
            kind = %message.kind,
            delivered = report.delivered,
            failed = report.failed,
            "Published"
        );
        telemetry::record_publish(&report);
        Ok(report)
    }

    /// Build and publish an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        room: &str,
        kind: &str,
        from: Option<&str>,
        payload: &T,
    ) -> Result<PublishReport, MessageError> {
        let mut message = Message::new(kind, room).with_serialized(payload)?;
        message.from = from.map(str::to_string);
        self.publish_message(&message)
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Number of connections joined to a room.
    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    /// Whether a connection is a member of a room.
    #[must_use]
    pub fn is_member(&self, room: &str, connection_id: &ConnectionId) -> bool {
        self.rooms
            .get(room)
            .map(|m| m.contains_key(connection_id))
            .unwrap_or(false)
    }

    /// Names of all live rooms.
    #[must_use]
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            room_count: self.rooms.len(),
            total_memberships: self.rooms.iter().map(|e| e.len()).sum(),
        }
    }
}
