use super::AppState;
use crate::auth::Identity;
use crate::sync::BroadcastHub;
use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use statemirror_protocol::{ClientMessage, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// GET /socket
///
/// The login middleware has already attached the caller's identity.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer_socket(socket, state, identity))
}

async fn send_message(ws_tx: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize viewer message: {}", e);
            return true;
        }
    };
    match ws_tx.send(Message::Text(json.into())).await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to send to viewer: {}", e);
            false
        }
    }
}

/// Run one viewer's writes one at a time, in the order they arrived.
///
/// Queued writes still reach the store after the viewer leaves; only their
/// replies are lost.
async fn drain_writes(
    hub: Arc<BroadcastHub>,
    mut writes: mpsc::UnboundedReceiver<ClientMessage>,
    replies: mpsc::UnboundedSender<ServerMessage>,
) {
    while let Some(request) = writes.recv().await {
        if let Some(reply) = hub.dispatch(request).await {
            let _ = replies.send(reply);
        }
    }
}

/// Drive one viewer: its requests, its replies and the pushes it receives.
///
/// Writes go through a queue private to this viewer so the store sees them in
/// receipt order. Reads run on their own task. Neither holds up pushes.
/// Replies come back through a channel private to this viewer, and a reply
/// for a viewer that already left is dropped with the channel.
async fn handle_viewer_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut viewer = state.hub.attach(identity);
    let viewer_id = viewer.id().to_string();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (write_tx, write_rx) = mpsc::unbounded_channel::<ClientMessage>();
    tokio::spawn(drain_writes(state.hub.clone(), write_rx, reply_tx.clone()));

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(request) if request.is_write() => {
                                debug!("Viewer {} write {:?}", viewer_id, request.request_id());
                                let _ = write_tx.send(request);
                            }
                            Ok(request) => {
                                debug!("Viewer {} request {:?}", viewer_id, request.request_id());
                                let hub = state.hub.clone();
                                let reply_tx = reply_tx.clone();
                                tokio::spawn(async move {
                                    if let Some(reply) = hub.dispatch(request).await {
                                        let _ = reply_tx.send(reply);
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("Viewer {} sent an unreadable message: {}", viewer_id, e);
                                let message = ServerMessage::Error {
                                    message: format!("invalid request: {}", e),
                                };
                                if !send_message(&mut ws_tx, &message).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Viewer {} closed the connection", viewer_id);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            push = viewer.next_push() => {
                match push {
                    Some(message) => {
                        if !send_message(&mut ws_tx, &message).await {
                            break;
                        }
                    }
                    None => break,
                }
            }

            Some(reply) = reply_rx.recv() => {
                if !send_message(&mut ws_tx, &reply).await {
                    break;
                }
            }

            _ = state.shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    drop(write_tx);
    drop(viewer);
    info!(
        "Viewer {} detached, viewers={}",
        viewer_id,
        state.hub.viewer_count()
    );
}
