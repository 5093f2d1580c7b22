//! Per-connection session lifecycle.
//!
//! A session moves through `Connecting → Active → Closing → Closed`:
//!
//! - **Connecting**: the upgrade parameters are validated by
//!   [`SessionManager::handshake`]. A rejected handshake creates no state.
//! - **Active**: the connection is joined to its room and, for the presence
//!   room, counted by the presence tracker. Pings go out on a fixed period
//!   and a read deadline closes connections that fall silent.
//! - **Closing/Closed**: the room is left and the presence lease released.
//!   This runs from a drop guard, so it happens exactly once on every exit
//!   path, including task abort.

use crate::connection::{
    Connection, ConnectionError, ConnectionId, FrameReader, InboundFrame, QueuedConnection,
};
use crate::hub::Hub;
use crate::message::Message;
use crate::presence::{PresenceLease, PresenceTracker};
use crate::room::{is_presence, validate_room_name, RoomId};
use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Default period between liveness probes.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Default read-inactivity deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

const PING_PAYLOAD: &[u8] = b"p";

/// Handshake errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No room parameter was supplied.
    #[error("room required")]
    MissingRoom,

    /// The room parameter is not a valid room name.
    #[error("invalid room: {0}")]
    InvalidRoom(&'static str),
}

/// Session timing configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Period between liveness probes.
    pub ping_interval: Duration,
    /// Close the connection after this long without any inbound frame.
    pub read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Upgrade parameters, as found in the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    /// Target room.
    pub room: Option<String>,
    /// Authenticated user, if any.
    pub user: Option<String>,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress.
    Connecting,
    /// Registered and relaying frames.
    Active,
    /// Cleanup in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// Why an active session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the transport.
    ClientClosed,
    /// No inbound frame within the read deadline.
    Timeout,
    /// The transport failed while reading.
    ReadError(String),
    /// A liveness probe could not be queued.
    SendFailed(String),
    /// The connection was closed from our side.
    Disconnected,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::Timeout => f.write_str("read timeout"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::SendFailed(e) => write!(f, "send failed: {e}"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A validated handshake, ready to become an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    room: RoomId,
    user_id: Option<String>,
}

impl Handshake {
    /// Target room.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// User supplied with the upgrade.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// The user to track presence for, if this session opts in.
    #[must_use]
    pub fn presence_user(&self) -> Option<&str> {
        if is_presence(&self.room) {
            self.user_id()
        } else {
            None
        }
    }
}

/// Hub and presence membership held by an active session.
///
/// Dropping it leaves the room and releases the presence lease.
struct Registration {
    hub: Arc<Hub>,
    presence: Arc<PresenceTracker>,
    room: RoomId,
    connection_id: ConnectionId,
    lease: Option<PresenceLease>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.leave(&self.room, &self.connection_id);

        if let Some(lease) = self.lease.take() {
            if self.presence.release(&lease) {
                info!(user = %lease.user_id(), "User offline");
                announce(&self.hub, &Message::offline(lease.user_id()));
            }
        }
    }
}

fn announce(hub: &Hub, message: &Message) {
    if let Err(e) = hub.publish_message(message) {
        warn!(room = %message.room, kind = %message.kind, error = %e, "Failed to publish");
    }
}

/// Runs sessions against a shared hub and presence tracker.
#[derive(Clone)]
pub struct SessionManager {
    hub: Arc<Hub>,
    presence: Arc<PresenceTracker>,
    config: SessionConfig,
}

impl SessionManager {
    /// Create a session manager.
    #[must_use]
    pub fn new(hub: Arc<Hub>, presence: Arc<PresenceTracker>, config: SessionConfig) -> Self {
        Self {
            hub,
            presence,
            config,
        }
    }

    /// The shared hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The shared presence tracker.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Validate upgrade parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is missing or invalid.
    pub fn handshake(&self, params: ConnectParams) -> Result<Handshake, SessionError> {
        let room = params
            .room
            .filter(|r| !r.is_empty())
            .ok_or(SessionError::MissingRoom)?;
        validate_room_name(&room).map_err(SessionError::InvalidRoom)?;

        let user_id = params.user.filter(|u| !u.is_empty());
        Ok(Handshake { room, user_id })
    }

    /// Drive an active session until it closes.
    ///
    /// `reader` must be cancel-safe: a pending `recv` may be dropped when a
    /// timer fires.
    pub async fn run<R: FrameReader>(
        &self,
        handshake: Handshake,
        connection: Arc<QueuedConnection>,
        mut reader: R,
    ) -> CloseReason {
        let id = connection.id().clone();
        let mut state = SessionState::Connecting;

        let registration = self.register(&handshake, &connection);
        transition(&id, &mut state, SessionState::Active);

        let reason = self.pump(&handshake, &connection, &mut reader).await;

        transition(&id, &mut state, SessionState::Closing);
        connection.close();
        drop(registration);
        transition(&id, &mut state, SessionState::Closed);

        info!(
            connection = %id,
            room = %handshake.room(),
            reason = %reason,
            "Session closed"
        );
        reason
    }

    fn register(&self, handshake: &Handshake, connection: &Arc<QueuedConnection>) -> Registration {
        let member: Arc<dyn Connection> = connection.clone();
        self.hub.join(handshake.room(), member);

        let lease = handshake.presence_user().map(|user| self.presence.acquire(user));
        if let Some(lease) = &lease {
            if lease.went_online() {
                info!(user = %lease.user_id(), "User online");
                announce(&self.hub, &Message::online(lease.user_id()));
            }
        }

        info!(
            connection = %connection.id(),
            room = %handshake.room(),
            user = ?handshake.user_id(),
            "Session active"
        );

        Registration {
            hub: Arc::clone(&self.hub),
            presence: Arc::clone(&self.presence),
            room: handshake.room.clone(),
            connection_id: connection.id().clone(),
            lease,
        }
    }

    async fn pump<R: FrameReader>(
        &self,
        handshake: &Handshake,
        connection: &QueuedConnection,
        reader: &mut R,
    ) -> CloseReason {
        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = tokio::time::sleep(self.config.read_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = connection.closed() => return CloseReason::Disconnected,

                () = &mut deadline => return CloseReason::Timeout,

                _ = ping.tick() => match connection.ping(Bytes::from_static(PING_PAYLOAD)) {
                    Ok(()) => trace!(connection = %connection.id(), "Ping queued"),
                    Err(ConnectionError::Backpressure) => {
                        debug!(connection = %connection.id(), "Ping dropped, queue full");
                    }
                    Err(e) => return CloseReason::SendFailed(e.to_string()),
                },

                frame = reader.recv() => match frame {
                    Ok(Some(frame)) => {
                        deadline.as_mut().reset(Instant::now() + self.config.read_timeout);
                        self.on_frame(handshake, connection, frame);
                    }
                    Ok(None) => return CloseReason::ClientClosed,
                    Err(e) => return CloseReason::ReadError(e.to_string()),
                },
            }
        }
    }

    fn on_frame(&self, handshake: &Handshake, connection: &QueuedConnection, frame: InboundFrame) {
        match frame {
            InboundFrame::Text(text) => {
                let message = Message::echo(handshake.room(), handshake.user_id(), text);
                announce(&self.hub, &message);
            }
            InboundFrame::Pong(_) => {
                if let Some(user) = handshake.presence_user() {
                    self.presence.touch(user);
                }
            }
            InboundFrame::Ping(data) => {
                if let Err(e) = connection.pong(data) {
                    debug!(connection = %connection.id(), error = %e, "Pong not queued");
                }
            }
            InboundFrame::Binary(data) => {
                trace!(connection = %connection.id(), len = data.len(), "Ignoring binary frame");
            }
        }
    }
}

fn transition(id: &ConnectionId, state: &mut SessionState, next: SessionState) {
    debug!(connection = %id, from = ?state, to = ?next, "Session state");
    *state = next;
}
