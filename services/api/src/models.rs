//! API Models
//!
//! Request and response bodies for the session control API, annotated for
//! OpenAPI generation with `utoipa`. The core types are mirrored here so the
//! core crate stays free of HTTP concerns.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use voxbridge_core::{
    ConnectionPhase, ConnectionState, ErrorInfo, ErrorKind, TransportParams, Voice,
};

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PhaseView {
    Idle,
    Connecting,
    Connected,
    Error,
}

impl From<ConnectionPhase> for PhaseView {
    fn from(phase: ConnectionPhase) -> Self {
        match phase {
            ConnectionPhase::Idle => PhaseView::Idle,
            ConnectionPhase::Connecting => PhaseView::Connecting,
            ConnectionPhase::Connected => PhaseView::Connected,
            ConnectionPhase::Error => PhaseView::Error,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKindView {
    Precondition,
    TransportError,
    Rejected,
    MalformedResponse,
}

impl From<ErrorKind> for ErrorKindView {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Precondition => ErrorKindView::Precondition,
            ErrorKind::TransportError => ErrorKindView::TransportError,
            ErrorKind::Rejected => ErrorKindView::Rejected,
            ErrorKind::MalformedResponse => ErrorKindView::MalformedResponse,
        }
    }
}

/// Error body returned by every failing endpoint.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    #[schema(example = "rejected")]
    pub kind: ErrorKindView,
    #[schema(example = "room full")]
    pub message: String,
}

impl From<ErrorInfo> for ErrorResponse {
    fn from(info: ErrorInfo) -> Self {
        Self {
            kind: info.kind.into(),
            message: info.message,
        }
    }
}

/// Snapshot of the connection as seen by the front-end.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    #[schema(example = "connected")]
    pub phase: PhaseView,
    pub should_connect: bool,
    #[schema(example = "wss://media.example.com")]
    pub transport_address: Option<String>,
    pub token: Option<String>,
    #[schema(example = "alloy")]
    pub voice: Option<String>,
    pub room_name: Option<String>,
    pub attempt: u64,
    pub last_error: Option<ErrorResponse>,
}

fn voice_name(voice: Voice) -> String {
    serde_json::to_value(voice)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

impl From<ConnectionState> for SessionView {
    fn from(state: ConnectionState) -> Self {
        let should_connect = state.should_connect();
        let (transport_address, token) = match state.credential {
            Some(c) => (Some(c.transport_address), Some(c.token)),
            None => (None, None),
        };
        Self {
            phase: state.phase.into(),
            should_connect,
            transport_address,
            token,
            voice: state.voice.map(voice_name),
            room_name: state.room_name,
            attempt: state.attempt,
            last_error: state.last_error.map(ErrorResponse::from),
        }
    }
}

/// Parameters for the browser's real-time client.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportView {
    pub should_connect: bool,
    #[schema(example = "wss://media.example.com")]
    pub ws_url: String,
    pub token: String,
}

impl From<TransportParams> for TransportView {
    fn from(params: TransportParams) -> Self {
        Self {
            should_connect: params.should_connect,
            ws_url: params.ws_url,
            token: params.token,
        }
    }
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderKeyPayload {
    #[schema(example = "sk-...")]
    pub api_key: String,
}
