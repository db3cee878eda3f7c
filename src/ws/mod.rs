//! WebSocket transport for the host.
//!
//! Each guest socket is bridged to a `ChannelConnection`: frames the session
//! queues are written to the socket, and whatever the socket yields is posted
//! back to the session as a `HostEvent`. The connection id is the peer id the
//! guest picked when dialing, so it stays the same on both ends.

pub mod client;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::session::HostEvent;
use crate::transport::ChannelConnection;
use crate::types::{ConnectionId, RoomId};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub room: Option<String>,
    pub peer: Option<String>,
}

/// Shared state of the host endpoint
#[derive(Clone)]
pub struct WsState {
    room_id: RoomId,
    events: mpsc::UnboundedSender<HostEvent>,
    /// Peer ids with a live socket
    live: Arc<Mutex<HashSet<ConnectionId>>>,
}

impl WsState {
    pub fn new(room_id: RoomId, events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self {
            room_id,
            events,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, peer: &ConnectionId) -> bool {
        self.live
            .lock()
            .map(|mut live| live.insert(peer.clone()))
            .unwrap_or(false)
    }

    fn release(&self, peer: &ConnectionId) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(peer);
        }
    }
}

pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<WsState>,
) -> Response {
    tracing::info!(
        "WebSocket connection request: room={:?}, peer={:?}",
        params.room,
        params.peer
    );

    if params.room.as_deref() != Some(state.room_id.as_str()) {
        return (StatusCode::NOT_FOUND, "unknown room").into_response();
    }
    let peer = match params.peer {
        Some(peer) if !peer.trim().is_empty() => peer,
        _ => return (StatusCode::BAD_REQUEST, "missing peer id").into_response(),
    };
    if !state.claim(&peer) {
        tracing::warn!("Rejecting second socket for peer {}", peer);
        return (StatusCode::CONFLICT, "peer id already connected").into_response();
    }

    let failed = (state.clone(), peer.clone());
    ws.on_failed_upgrade(move |e| {
        tracing::error!("WebSocket upgrade for {} failed: {}", failed.1, e);
        failed.0.release(&failed.1);
    })
    .on_upgrade(move |socket| handle_socket(socket, peer, state))
}

/// Pump one guest socket until either side goes away
async fn handle_socket(socket: WebSocket, peer: ConnectionId, state: WsState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbox) = ChannelConnection::pair(peer.clone());

    if state
        .events
        .send(HostEvent::Connected(Arc::new(conn)))
        .is_err()
    {
        tracing::warn!("Host session is gone; dropping {}", peer);
        state.release(&peer);
        return;
    }

    let mut error = None;
    loop {
        tokio::select! {
            frame = outbox.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sender.send(Message::Text(text.into())).await {
                        error = Some(e.to_string());
                        break;
                    }
                }
                // Session dropped the connection
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            ws_msg = receiver.next() => match ws_msg {
                Some(Ok(Message::Text(text))) => {
                    let event = HostEvent::Message {
                        from: peer.clone(),
                        text: text.to_string(),
                    };
                    if state.events.send(event).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error = Some(e.to_string());
                    break;
                }
            },
        }
    }

    let event = match error {
        Some(error) => HostEvent::Errored {
            from: peer.clone(),
            error,
        },
        None => HostEvent::Closed { from: peer.clone() },
    };
    let _ = state.events.send(event);
    state.release(&peer);
    tracing::info!("WebSocket connection closed for peer {}", peer);
}
