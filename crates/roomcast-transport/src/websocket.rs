//! WebSocket transport over axum.
//!
//! The socket is split: the read half becomes a [`WebSocketReader`] for the
//! session loop, and the write half is owned by a writer task that drains
//! the connection's outbound queue.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roomcast_core::{
    Connection, ConnectionError, FrameReader, InboundFrame, Outbound, OverflowPolicy,
    QueuedConnection,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Read half of a WebSocket.
pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<InboundFrame>, ConnectionError> {
        match self.stream.next().await {
            Some(Ok(message)) => Ok(inbound_frame(message)),
            Some(Err(e)) => Err(ConnectionError::ReceiveFailed(e.to_string())),
            None => Ok(None),
        }
    }
}

/// A socket wired up for a session.
pub struct AttachedSocket {
    /// The hub-facing connection.
    pub connection: Arc<QueuedConnection>,
    /// The session-facing read half.
    pub reader: WebSocketReader,
    /// The writer task; it exits once the connection is closed.
    pub writer: JoinHandle<()>,
}

/// Split a WebSocket into a queued connection, a reader and a writer task.
#[must_use]
pub fn attach(socket: WebSocket, outbound_buffer: usize, policy: OverflowPolicy) -> AttachedSocket {
    let (sink, stream) = socket.split();
    let (connection, outbound) = QueuedConnection::new(outbound_buffer, policy);
    let writer = tokio::spawn(write_loop(sink, outbound, Arc::clone(&connection)));

    AttachedSocket {
        connection,
        reader: WebSocketReader { stream },
        writer,
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    connection: Arc<QueuedConnection>,
) {
    let closed = connection.close_token();

    loop {
        tokio::select! {
            biased;

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(ws_message(frame)).await {
                        debug!(connection = %connection.id(), error = %e, "Write failed");
                        connection.close();
                        return;
                    }
                }
                None => break,
            },

            () = closed.cancelled() => break,
        }
    }

    trace!(connection = %connection.id(), "Writer closing socket");
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Map a socket message to a session frame. `None` means the client closed.
fn inbound_frame(message: Message) -> Option<InboundFrame> {
    match message {
        Message::Text(text) => Some(InboundFrame::Text(text)),
        Message::Binary(data) => Some(InboundFrame::Binary(Bytes::from(data))),
        Message::Ping(data) => Some(InboundFrame::Ping(Bytes::from(data))),
        Message::Pong(data) => Some(InboundFrame::Pong(Bytes::from(data))),
        Message::Close(_) => None,
    }
}

/// Map a queued frame to a socket message.
///
/// Serialized messages are JSON and go out as text frames.
fn ws_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Frame(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        },
        Outbound::Ping(data) => Message::Ping(data.to_vec()),
        Outbound::Pong(data) => Message::Pong(data.to_vec()),
    }
}
