//! Outbound WebSocket adapter.
//!
//! Each accepted connection opens its own hub subscription with a bounded
//! buffer. Enriched packets are serialized to JSON and sent; encode or send
//! failure closes that connection only. The adapter reads from the client
//! solely to detect close.

use crate::http::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{debug, warn};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (handle, mut rx) = state.hub.subscribe(state.subscriber_capacity);
    debug!("websocket client subscribed");

    loop {
        tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => {
                    // Errored packets never go out on the wire.
                    if packet.error.is_some() {
                        continue;
                    }
                    let json = match serde_json::to_string(&*packet) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "packet encode failed; closing connection");
                            break;
                        }
                    };
                    if socket.send(Message::Text(json)).await.is_err() {
                        debug!("websocket send failed; closing connection");
                        break;
                    }
                }
                // Hub shut down.
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Clients are write-only from our side; ignore their chatter.
                Some(Ok(_)) => {}
            },
        }
    }

    state.hub.close(&handle);
    debug!("websocket client unsubscribed");
}
