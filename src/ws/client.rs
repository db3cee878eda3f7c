//! Guest side of the WebSocket transport

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::session::GuestEvent;
use crate::transport::{TransportError, TransportResult};
use crate::types::{ConnectionId, RoomId};

/// Dial target for a guest: `<host_url>?room=<room>&peer=<peer>`
pub fn guest_url(host_url: &str, room_id: &RoomId, peer: &ConnectionId) -> String {
    let separator = if host_url.contains('?') { '&' } else { '?' };
    format!("{}{}room={}&peer={}", host_url, separator, room_id, peer)
}

/// Open the socket to the host and bridge it to a guest session.
///
/// `outbox` is the receiving half of the guest's `ChannelConnection`. Once
/// the socket is up the session gets `Connected`, then every text frame as
/// `Message`, then exactly one `Closed` or `Errored`.
pub async fn dial(
    url: &str,
    mut outbox: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<GuestEvent>,
) -> TransportResult<()> {
    let (stream, _) = connect_async(url)
        .await
        .map_err(|e| TransportError::WebSocket(Box::new(e)))?;
    tracing::info!("Connected to {}", url);

    let (mut sink, mut stream) = stream.split();
    let _ = events.send(GuestEvent::Connected);

    tokio::spawn(async move {
        let mut error = None;
        loop {
            tokio::select! {
                frame = outbox.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            error = Some(e.to_string());
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },

                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(GuestEvent::Message(text.to_string())).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error = Some(e.to_string());
                        break;
                    }
                },
            }
        }

        let _ = match error {
            Some(error) => events.send(GuestEvent::Errored(error)),
            None => events.send(GuestEvent::Closed),
        };
        tracing::info!("Connection to host closed");
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_url() {
        assert_eq!(
            guest_url("ws://10.0.0.2:6574/ws", &"R1".to_string(), &"p1".to_string()),
            "ws://10.0.0.2:6574/ws?room=R1&peer=p1"
        );
        assert_eq!(
            guest_url("ws://h/ws?v=1", &"R1".to_string(), &"p1".to_string()),
            "ws://h/ws?v=1&room=R1&peer=p1"
        );
    }
}
