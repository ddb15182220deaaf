use crate::chat::engine::CoordinationEngine;
use crate::core::config::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, engine))
}

/// One reader loop and one writer task per socket. Whichever side ends
/// first takes the other down, then the connection is released.
async fn handle_socket(socket: WebSocket, engine: Arc<CoordinationEngine>) {
    let (conn, mut outbox) = engine.open_connection();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!("[WS] Connection {} opened", conn);

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("[WS] Failed to encode {}: {}", event.name(), e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let reader = engine.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => reader.handle_frame(conn, text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("[WS] Read error on {}: {}", conn, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    engine.close_connection(conn).await;
    info!("[WS] Connection {} closed", conn);
}
