//! WebSocket route handler.
//!
//! Handles WebSocket upgrade, message loop, and cleanup.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::messages::{
    msg_types, CancelResult, ClientMessage, Connected, ErrorPayload, ServerMessage, StatusUpdate,
};
use crate::download_manager::{DownloadManager, Subscription};
use crate::server::state::GuardedDownloadManager;

/// Replies queued by the incoming side before the forwarder picks them up.
const REPLY_BUFFER: usize = 32;

/// WebSocket upgrade handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(manager): State<GuardedDownloadManager>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, manager))
}

fn status_update(manager: &DownloadManager) -> ServerMessage {
    ServerMessage::new(
        msg_types::STATUS_UPDATE,
        StatusUpdate {
            progress: manager.get_progress(None).ok(),
            queue: manager.get_queue(),
        },
    )
}

/// Handle an established WebSocket connection.
async fn handle_socket(socket: WebSocket, manager: GuardedDownloadManager) {
    let subscription = manager.subscribe();
    let subscriber_id = subscription.id();
    debug!("WebSocket connected: subscriber {}", subscriber_id);

    let (ws_sink, ws_stream) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);

    let initial = vec![
        ServerMessage::new(
            msg_types::CONNECTED,
            Connected {
                server_version: format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("GIT_HASH")),
            },
        ),
        status_update(&manager),
    ];

    let outgoing_handle = tokio::spawn(forward_outgoing(ws_sink, subscription, reply_rx, initial));

    process_incoming(ws_stream, &manager, &reply_tx).await;

    debug!("WebSocket disconnected: subscriber {}", subscriber_id);
    outgoing_handle.abort();
}

async fn send_json(
    ws_sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => ws_sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize WebSocket message: {}", e);
            true
        }
    }
}

/// Forward engine events and replies to the WebSocket.
async fn forward_outgoing(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut subscription: Subscription,
    mut reply_rx: mpsc::Receiver<ServerMessage>,
    initial: Vec<ServerMessage>,
) {
    for msg in &initial {
        if !send_json(&mut ws_sink, msg).await {
            return;
        }
    }

    loop {
        let msg = tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(msg) => msg,
                None => break,
            },
            event = subscription.recv() => match event {
                Some(event) => ServerMessage::from_event(&event),
                None => break,
            },
        };
        if !send_json(&mut ws_sink, &msg).await {
            break;
        }
    }

    if subscription.dropped_count() > 0 {
        debug!(
            "Subscriber {} lost {} event(s)",
            subscription.id(),
            subscription.dropped_count()
        );
    }
}

/// Process incoming messages from the WebSocket.
async fn process_incoming(
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    manager: &DownloadManager,
    reply_tx: &mpsc::Sender<ServerMessage>,
) {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let reply = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => handle_client_message(manager, msg),
                    Err(e) => {
                        debug!("Failed to parse client message: {}", e);
                        ServerMessage::new(
                            msg_types::ERROR,
                            ErrorPayload::new("parse_error", format!("Invalid message: {}", e)),
                        )
                    }
                };
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("Received close frame");
                break;
            }
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        }
    }
}

/// Handle a parsed client message, returning the reply.
fn handle_client_message(manager: &DownloadManager, msg: ClientMessage) -> ServerMessage {
    match msg {
        ClientMessage::Ping => ServerMessage::empty(msg_types::PONG),
        ClientMessage::RequestStatus => status_update(manager),
        ClientMessage::Cancel { item_id } => {
            let result = match manager.cancel_item(&item_id) {
                Ok(outcome) => CancelResult {
                    item_id,
                    success: true,
                    outcome: Some(outcome.label().to_string()),
                    error: None,
                },
                Err(e) => CancelResult {
                    item_id,
                    success: false,
                    outcome: None,
                    error: Some(e.code().to_string()),
                },
            };
            ServerMessage::new(msg_types::CANCEL_RESULT, result)
        }
    }
}
