//! Session Data Model
//!
//! The values exchanged between the negotiator, the connection manager and
//! whoever observes the manager: credentials, the published connection state,
//! and the outbound session request.

use crate::error::{NegotiationError, NegotiationFailure, PreconditionError, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The address and join token for the real-time media server.
///
/// Issued once per successful negotiation and never reused after a disconnect.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    pub transport_address: String,
    pub token: String,
}

impl SessionCredential {
    pub fn new(transport_address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            transport_address: transport_address.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("transport_address", &self.transport_address)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// The voice the remote agent speaks with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Alloy,
    Ash,
    Ballad,
    Coral,
    Echo,
    Sage,
    Shimmer,
    Verse,
}

impl FromStr for Voice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "alloy" => Ok(Voice::Alloy),
            "ash" => Ok(Voice::Ash),
            "ballad" => Ok(Voice::Ballad),
            "coral" => Ok(Voice::Coral),
            "echo" => Ok(Voice::Echo),
            "sage" => Ok(Voice::Sage),
            "shimmer" => Ok(Voice::Shimmer),
            "verse" => Ok(Voice::Verse),
            other => Err(format!("'{}' is not a known voice", other)),
        }
    }
}

/// Lifecycle phase of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionPhase::Idle => write!(f, "idle"),
            ConnectionPhase::Connecting => write!(f, "connecting"),
            ConnectionPhase::Connected => write!(f, "connected"),
            ConnectionPhase::Error => write!(f, "error"),
        }
    }
}

/// Category of the last recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Precondition,
    TransportError,
    Rejected,
    MalformedResponse,
}

impl From<NegotiationFailure> for ErrorKind {
    fn from(reason: NegotiationFailure) -> Self {
        match reason {
            NegotiationFailure::TransportError => ErrorKind::TransportError,
            NegotiationFailure::Rejected => ErrorKind::Rejected,
            NegotiationFailure::MalformedResponse => ErrorKind::MalformedResponse,
        }
    }
}

/// A serializable record of a `connect()` failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PreconditionError> for ErrorInfo {
    fn from(err: &PreconditionError) -> Self {
        Self {
            kind: ErrorKind::Precondition,
            message: err.to_string(),
        }
    }
}

impl From<&NegotiationError> for ErrorInfo {
    fn from(err: &NegotiationError) -> Self {
        Self {
            kind: err.reason.into(),
            message: err
                .message
                .clone()
                .unwrap_or_else(|| err.reason.to_string()),
        }
    }
}

impl From<&SessionError> for ErrorInfo {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::Precondition(e) => e.into(),
            SessionError::Negotiation(e) => e.into(),
        }
    }
}

/// The single source of truth published by the connection manager.
///
/// `credential` is present exactly when `phase` is `Connected`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub credential: Option<SessionCredential>,
    pub last_error: Option<ErrorInfo>,
    pub voice: Option<Voice>,
    pub room_name: Option<String>,
    /// Tag of the most recent negotiation attempt. Bumped on every new
    /// attempt and on every cancellation.
    pub attempt: u64,
}

impl ConnectionState {
    /// The connect-flag: whether the real-time client should be connected.
    pub fn should_connect(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub fn transport_params(&self) -> TransportParams {
        match (&self.credential, self.should_connect()) {
            (Some(credential), true) => TransportParams {
                should_connect: true,
                ws_url: credential.transport_address.clone(),
                token: credential.token.clone(),
            },
            _ => TransportParams::default(),
        }
    }
}

/// The triple handed verbatim to the external real-time client.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub should_connect: bool,
    pub ws_url: String,
    pub token: String,
}

/// Options forwarded to the broker along with a session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub skip_welcome_message: bool,
}

/// The outbound negotiation payload, built fresh for every `connect()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub room_name: String,
    pub participant_id: String,
    pub agent_id: String,
    pub options: SessionOptions,
}

/// Static identity the manager stamps onto each request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    pub participant_id: String,
    pub agent_id: String,
    pub skip_welcome_message: bool,
    pub voice: Voice,
    pub room_prefix: String,
}

impl SessionProfile {
    pub fn new(participant_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            agent_id: agent_id.into(),
            skip_welcome_message: true,
            voice: Voice::default(),
            room_prefix: "room".to_string(),
        }
    }

    /// Builds a request with a room name no earlier request has used.
    pub fn new_request(&self) -> SessionRequest {
        SessionRequest {
            room_name: format!("{}-{}", self.room_prefix, Uuid::new_v4().simple()),
            participant_id: self.participant_id.clone(),
            agent_id: self.agent_id.clone(),
            options: SessionOptions {
                skip_welcome_message: self.skip_welcome_message,
            },
        }
    }
}
