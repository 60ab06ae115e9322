//! Defines the WebSocket message protocol between the browser client and the API server.

use crate::models::SessionView;
use serde::Serialize;

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A complete snapshot of the connection state. Sent on open and after
    /// every transition.
    State { state: SessionView },
}
