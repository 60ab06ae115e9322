//! Voxbridge API Library Crate
//!
//! This library contains the HTTP surface around the voice session core:
//! configuration, application state, API handlers, the WebSocket state
//! stream, and routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
