//! Streams connection state changes to a browser over a WebSocket.

use super::protocol::ServerMessage;
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Forwards every published `ConnectionState` until either side goes away.
///
/// The stream is read-only; anything the client sends besides a close frame
/// is ignored.
#[instrument(name = "state_stream", skip_all, fields(stream_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let stream_id: u32 = rand::random();
    tracing::Span::current().record("stream_id", stream_id);
    info!("New state stream connection.");

    let (mut socket_tx, mut socket_rx) = socket.split();
    let mut state_rx = state.manager.subscribe();

    let initial = state_rx.borrow_and_update().clone();
    if send_msg(&mut socket_tx, ServerMessage::State { state: initial.into() })
        .await
        .is_err()
    {
        warn!("Failed to send initial state to client.");
        return;
    }

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    debug!("Connection manager dropped; closing stream.");
                    break;
                }
                let snapshot = state_rx.borrow_and_update().clone();
                if let Err(e) = send_msg(&mut socket_tx, ServerMessage::State { state: snapshot.into() }).await {
                    warn!(error = ?e, "Failed to push state update; closing stream.");
                    break;
                }
            },
            msg = socket_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client closed state stream.");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = ?e, "Error receiving from client WebSocket.");
                        break;
                    }
                }
            },
        }
    }
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
