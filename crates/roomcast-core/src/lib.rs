//! # roomcast-core
//!
//! Room fan-out, presence tracking and connection sessions for roomcast.
//!
//! - **Message** - Event envelope published to rooms
//! - **Connection** - Send/close capability over one client transport
//! - **Hub** - Room registry and fan-out
//! - **Presence** - Per-user connection counting with heartbeat expiry
//! - **Session** - Lifecycle of one connection from handshake to cleanup
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Session   │────▶│     Hub     │◀──── publish()
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   ▲
//!                            ▼                   │ online/offline
//!                     ┌─────────────┐            │
//!                     │  Presence   │────────────┘
//!                     └─────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod message;
pub mod presence;
pub mod room;
pub mod session;
pub mod telemetry;

pub use connection::{
    ChannelReader, Connection, ConnectionError, ConnectionId, FrameReader, FrameSender,
    InboundFrame, Outbound, OverflowPolicy, QueuedConnection,
};
pub use hub::{Hub, HubStats, PublishReport};
pub use message::{Message, MessageError};
pub use presence::{OnlineUser, PresenceConfig, PresenceLease, PresenceTracker, SweeperHandle};
pub use session::{
    CloseReason, ConnectParams, Handshake, SessionConfig, SessionError, SessionManager,
    SessionState,
};
