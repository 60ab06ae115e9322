//! WebSocket State Stream
//!
//! Pushes the connection manager's state to browser clients as it changes.
//!
//! - `protocol`: Defines the JSON message format sent to the client.
//! - `session`: Manages each stream from upgrade to close.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
