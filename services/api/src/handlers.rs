//! Axum Handlers for the REST API
//!
//! This module exposes the connection manager's operations over HTTP.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{info, warn};
use voxbridge_core::{ErrorInfo, SessionError};

use crate::{
    models::{ErrorResponse, ProviderKeyPayload, SessionView, TransportView},
    state::AppState,
};

pub enum ApiError {
    Session(SessionError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Session(err) => {
                let status = match err {
                    SessionError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
                    SessionError::Negotiation(_) => StatusCode::BAD_GATEWAY,
                };
                warn!(%status, error = %err, "Connect request failed");
                let body = ErrorResponse::from(ErrorInfo::from(&err));
                (status, Json(body)).into_response()
            }
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

/// Negotiate a new voice session with the broker.
///
/// Returns immediately with the current state when a session is already
/// connecting or connected. An attempt cancelled by a disconnect or by key
/// removal also answers 200, with the session back in `idle`.
#[utoipa::path(
    post,
    path = "/session/connect",
    responses(
        (status = 200, description = "Session connected or already active", body = SessionView),
        (status = 412, description = "Provider API key missing", body = ErrorResponse),
        (status = 502, description = "Broker negotiation failed", body = ErrorResponse)
    )
)]
pub async fn connect(State(state): State<Arc<AppState>>) -> Result<Json<SessionView>, ApiError> {
    state.manager.connect().await?;
    Ok(Json(state.manager.state().into()))
}

/// Tear down the current session.
#[utoipa::path(
    post,
    path = "/session/disconnect",
    responses(
        (status = 200, description = "Session state after disconnecting", body = SessionView)
    )
)]
pub async fn disconnect(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    state.manager.disconnect().await;
    Json(state.manager.state().into())
}

/// Get the current connection state.
#[utoipa::path(
    get,
    path = "/session",
    responses(
        (status = 200, description = "Current connection state", body = SessionView)
    )
)]
pub async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionView> {
    Json(state.manager.state().into())
}

/// Get the parameters for the browser's real-time client.
#[utoipa::path(
    get,
    path = "/session/transport",
    responses(
        (status = 200, description = "Connect flag, media server address and token", body = TransportView)
    )
)]
pub async fn get_transport(State(state): State<Arc<AppState>>) -> Json<TransportView> {
    Json(state.manager.transport_params().into())
}

/// Store the assistant-provider API key required to connect.
#[utoipa::path(
    put,
    path = "/provider-key",
    request_body = ProviderKeyPayload,
    responses(
        (status = 204, description = "Key stored")
    )
)]
pub async fn set_provider_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProviderKeyPayload>,
) -> StatusCode {
    state.manager.provider_key().set(payload.api_key);
    info!("Provider key updated.");
    StatusCode::NO_CONTENT
}

/// Remove the assistant-provider API key. An active session is disconnected.
#[utoipa::path(
    delete,
    path = "/provider-key",
    responses(
        (status = 204, description = "Key removed")
    )
)]
pub async fn clear_provider_key(State(state): State<Arc<AppState>>) -> StatusCode {
    state.manager.provider_key().clear();
    info!("Provider key cleared.");
    StatusCode::NO_CONTENT
}
