//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the one connection
//! manager.

use voxbridge_core::ConnectionManager;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: ConnectionManager,
}
