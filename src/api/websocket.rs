use axum::{
    extract::{State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::IntoResponse,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::AppEvent;
use crate::session::SessionSnapshot;
use crate::state::ServiceContext;

/// Streams session events as JSON. The first frame is the current
/// snapshot so a client can render without a separate GET.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<ServiceContext>,
) -> impl IntoResponse {
    // Subscribe before taking the snapshot so nothing falls in between.
    let event_rx = ctx.event_tx.subscribe();
    let snapshot = ctx.snapshot();
    ws.on_upgrade(move |socket| handle_socket(socket, snapshot, event_rx))
}

async fn handle_socket(
    mut socket: WebSocket,
    snapshot: SessionSnapshot,
    mut event_rx: broadcast::Receiver<AppEvent>,
) {
    debug!("WebSocket client connected");

    let hello = serde_json::json!({ "type": "Snapshot", "data": snapshot });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = event_rx.recv() => {
                match result {
                    Ok(event) => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if socket.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Failed to serialize event: {}", e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            // Client input is limited to ping and close
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!("WebSocket client disconnected");
}
