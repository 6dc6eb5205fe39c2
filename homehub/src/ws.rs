//! Real-time subscriber endpoint: one snapshot, then deltas until either side
//! goes away.

use crate::broadcast::Subscription;
use crate::hub::Hub;
use crate::rest::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state.hub))
}

async fn serve_subscriber(socket: WebSocket, hub: Arc<Hub>) {
    let Subscription { id, mut rx } = hub.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            delta = rx.recv() => {
                // None means the hub dropped this subscriber.
                let Some(delta) = delta else {
                    debug!("Subscriber {} evicted by hub", id);
                    break;
                };
                let text = match serde_json::to_string(&*delta) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize delta for subscriber {}: {}", id, e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.broadcast.unsubscribe(id);
    let _ = sink.close().await;
}
