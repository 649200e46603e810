use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::broadcast::{Broadcaster, Update};
use crate::state::AppState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broadcaster): State<Arc<Broadcaster>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

fn encode(update: &Update) -> Option<Message> {
    match serde_json::to_string(update) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode update");
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, broadcaster: Arc<Broadcaster>) {
    let subscription = broadcaster.subscribe().await;
    let id = subscription.id;
    let mut updates = subscription.updates;
    let (mut sender, mut receiver) = socket.split();

    let mut open = match encode(&subscription.initial) {
        Some(message) => sender.send(message).await.is_ok(),
        None => true,
    };

    while open {
        tokio::select! {
            update = updates.recv() => match update {
                Some(update) => {
                    if let Some(message) = encode(&update) {
                        open = sender.send(message).await.is_ok();
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    open = false;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => open = false,
                Some(Err(err)) => {
                    tracing::debug!(subscriber = %id, error = %err, "websocket receive failed");
                    open = false;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    broadcaster.unsubscribe(id).await;
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}
