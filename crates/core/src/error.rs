use serde::{Deserialize, Serialize};
use std::fmt;

/// Local validation failures detected before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("an assistant-provider API key is required to connect")]
    MissingProviderKey,
}

/// The machine-checkable reason a negotiation with the broker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationFailure {
    /// The broker could not be reached or did not answer with HTTP 200.
    TransportError,
    /// The broker answered but explicitly refused the session.
    Rejected,
    /// The broker answered with a body that does not match the expected schema.
    MalformedResponse,
}

impl fmt::Display for NegotiationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationFailure::TransportError => write!(f, "transport_error"),
            NegotiationFailure::Rejected => write!(f, "rejected"),
            NegotiationFailure::MalformedResponse => write!(f, "malformed_response"),
        }
    }
}

/// A failed exchange with the session broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("negotiation failed ({reason}){}", detail(.message))]
pub struct NegotiationError {
    pub reason: NegotiationFailure,
    /// The broker-supplied (or locally derived) message, when one is available.
    pub message: Option<String>,
}

impl NegotiationError {
    pub fn new(reason: NegotiationFailure, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: Some(message.into()),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(NegotiationFailure::TransportError, message)
    }

    pub fn rejected(message: Option<String>) -> Self {
        Self {
            reason: NegotiationFailure::Rejected,
            message,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(NegotiationFailure::MalformedResponse, message)
    }
}

fn detail(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|message| format!(": {message}"))
        .unwrap_or_default()
}

/// Everything `ConnectionManager::connect` can reject with.
///
/// A `connect()` whose attempt was cancelled by `disconnect()` or by removal
/// of the provider key resolves `Ok(())` instead, whatever the broker said.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}
