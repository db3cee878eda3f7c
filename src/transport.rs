//! Connection seam between sessions and whatever carries their messages.
//!
//! A `Connection` only has to deliver text frames in order and say whether it
//! is still open. Incoming traffic, closes and errors reach the sessions as
//! events on their channels (see `session`), so the core never sees transport
//! internals.

use crate::protocol::{self, WireMessage};
use crate::types::ConnectionId;
use tokio::sync::mpsc;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

pub trait Connection: Send + Sync {
    fn id(&self) -> &ConnectionId;

    /// Queue an already-encoded frame
    fn send_text(&self, text: String) -> TransportResult<()>;

    fn is_open(&self) -> bool;

    fn send(&self, msg: &WireMessage) -> TransportResult<()> {
        self.send_text(protocol::encode(msg)?)
    }
}

/// Connection backed by an unbounded channel.
///
/// The receiving half belongs to whatever pumps frames onto the wire (a
/// websocket task) or to a test. Once it is dropped the connection reports
/// closed and every send fails.
#[derive(Debug, Clone)]
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelConnection {
    pub fn pair(id: impl Into<ConnectionId>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), tx }, rx)
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn send_text(&self, text: String) -> TransportResult<()> {
        self.tx
            .send(text)
            .map_err(|_| TransportError::Closed(self.id.clone()))
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
