//! Session Negotiation
//!
//! Turns a `SessionRequest` into a `SessionCredential` via a single exchange
//! with the remote session broker.

use crate::error::NegotiationError;
use crate::session::{SessionCredential, SessionRequest};
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Defines the contract for anything that can authorize a new session.
///
/// Implementations are stateless and perform no retries; the caller decides
/// whether a failed negotiation should be attempted again.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(
        &self,
        request: &SessionRequest,
    ) -> Result<SessionCredential, NegotiationError>;
}

/// Endpoint settings for `BrokerNegotiator`.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub broker_url: String,
    /// The media server address paired with every issued token. The broker
    /// does not return one.
    pub transport_address: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
}

impl BrokerConfig {
    pub fn new(broker_url: impl Into<String>, transport_address: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            transport_address: transport_address.into(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JoinRoomBody<'a> {
    room_name: &'a str,
    user_id: &'a str,
    assistant_id: &'a str,
    skip_welcome_message: bool,
}

#[derive(Deserialize, Debug)]
struct JoinRoomResponse {
    success: bool,
    data: Option<JoinRoomData>,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct JoinRoomData {
    token: Option<String>,
}

/// A `Negotiator` that talks JSON over HTTPS to the session broker.
pub struct BrokerNegotiator {
    client: reqwest::Client,
    config: BrokerConfig,
}

impl BrokerNegotiator {
    pub fn new(config: BrokerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Negotiator for BrokerNegotiator {
    #[instrument(name = "negotiate", skip_all, fields(room = %request.room_name))]
    async fn negotiate(
        &self,
        request: &SessionRequest,
    ) -> Result<SessionCredential, NegotiationError> {
        let body = JoinRoomBody {
            room_name: &request.room_name,
            user_id: &request.participant_id,
            assistant_id: &request.agent_id,
            skip_welcome_message: request.options.skip_welcome_message,
        };

        let mut http_request = self.client.post(&self.config.broker_url).json(&body);
        if let Some(api_key) = &self.config.api_key {
            http_request = http_request.bearer_auth(api_key.expose_secret());
        }

        let response = http_request.send().await.map_err(|e| {
            warn!(error = %e, "Broker request failed");
            NegotiationError::transport(e.to_string())
        })?;

        let status = response.status();
        debug!(%status, "Broker responded");
        let bytes = response.bytes().await.map_err(|e| {
            warn!(error = %e, "Failed to read broker response body");
            NegotiationError::transport(e.to_string())
        })?;

        if status != StatusCode::OK {
            let message = serde_json::from_slice::<JoinRoomResponse>(&bytes)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("broker responded with HTTP {}", status.as_u16()));
            warn!(%status, "Broker did not accept the request");
            return Err(NegotiationError::transport(message));
        }

        let decoded: JoinRoomResponse = serde_json::from_slice(&bytes).map_err(|e| {
            warn!(error = %e, "Broker response did not match the expected schema");
            NegotiationError::malformed(e.to_string())
        })?;

        if !decoded.success {
            warn!(error = ?decoded.error, "Broker rejected the session");
            return Err(NegotiationError::rejected(decoded.error));
        }

        let token = decoded
            .data
            .and_then(|d| d.token)
            .ok_or_else(|| NegotiationError::malformed("response is missing data.token"))?;

        Ok(SessionCredential::new(
            self.config.transport_address.clone(),
            token,
        ))
    }
}
