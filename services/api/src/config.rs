use secrecy::SecretString;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;
use voxbridge_core::{BrokerConfig, SessionProfile, Voice};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub broker_url: String,
    pub broker_api_key: Option<SecretString>,
    pub broker_timeout: Duration,
    pub transport_address: String,
    pub agent_id: String,
    pub participant_id: String,
    pub skip_welcome_message: bool,
    pub voice: Voice,
    pub room_prefix: String,
    pub openai_api_key: Option<SecretString>,
    pub log_level: Level,
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn optional_secret(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let broker_url = required("BROKER_URL")?;
        let broker_api_key = optional_secret("BROKER_API_KEY");

        let timeout_str = std::env::var("BROKER_TIMEOUT_SECS").unwrap_or_else(|_| "10".to_string());
        let broker_timeout = timeout_str
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| {
                ConfigError::InvalidValue("BROKER_TIMEOUT_SECS".to_string(), e.to_string())
            })?;

        let transport_address = required("TRANSPORT_ADDRESS")?;
        let agent_id = required("AGENT_ID")?;
        let participant_id =
            std::env::var("PARTICIPANT_ID").unwrap_or_else(|_| "voxbridge-user".to_string());

        let skip_str = std::env::var("SKIP_WELCOME_MESSAGE").unwrap_or_else(|_| "true".to_string());
        let skip_welcome_message = match skip_str.to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            other => {
                return Err(ConfigError::InvalidValue(
                    "SKIP_WELCOME_MESSAGE".to_string(),
                    format!("'{}' is not a boolean", other),
                ));
            }
        };

        let voice = std::env::var("VOICE")
            .unwrap_or_else(|_| "alloy".to_string())
            .parse::<Voice>()
            .map_err(|e| ConfigError::InvalidValue("VOICE".to_string(), e))?;

        let room_prefix = std::env::var("ROOM_PREFIX").unwrap_or_else(|_| "room".to_string());
        let openai_api_key = optional_secret("OPENAI_API_KEY");

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            broker_url,
            broker_api_key,
            broker_timeout,
            transport_address,
            agent_id,
            participant_id,
            skip_welcome_message,
            voice,
            room_prefix,
            openai_api_key,
            log_level,
        })
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            broker_url: self.broker_url.clone(),
            transport_address: self.transport_address.clone(),
            api_key: self.broker_api_key.clone(),
            timeout: self.broker_timeout,
        }
    }

    pub fn session_profile(&self) -> SessionProfile {
        SessionProfile {
            participant_id: self.participant_id.clone(),
            agent_id: self.agent_id.clone(),
            skip_welcome_message: self.skip_welcome_message,
            voice: self.voice,
            room_prefix: self.room_prefix.clone(),
        }
    }
}
