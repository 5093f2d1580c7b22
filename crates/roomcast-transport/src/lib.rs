//! # roomcast-transport
//!
//! Transport adapters that connect client sockets to roomcast sessions.
//!
//! A transport supplies two halves:
//!
//! - a [`FrameReader`](roomcast_core::FrameReader) the session pulls inbound
//!   frames from, and
//! - a writer task that drains a
//!   [`QueuedConnection`](roomcast_core::QueuedConnection)'s outbound queue
//!   into the socket.
//!
//! ```rust,ignore
//! use roomcast_transport::websocket;
//!
//! let attached = websocket::attach(socket, 256, OverflowPolicy::DropNewest);
//! sessions.run(handshake, attached.connection, attached.reader).await;
//! ```

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "websocket")]
pub use websocket::{attach, AttachedSocket, WebSocketReader};
