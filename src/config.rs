// Logging defaults follow the build profile: debug builds log verbosely,
// release builds only warnings. RUST_LOG always overrides.

use crate::error::SignalingError;
use crate::peer::types::{MediaConstraints, ServerConfig};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Wait before a lost peer connection is treated as failed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub ice_servers: Vec<ServerConfig>,
    /// Milliseconds, see [`GRACE_PERIOD`].
    pub grace_period_ms: u64,
    pub command_buffer: usize,
    pub event_buffer: usize,
    /// Reception requested when the joiner answers.
    pub answer_constraints: MediaConstraints,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            grace_period_ms: GRACE_PERIOD.as_millis() as u64,
            command_buffer: 32,
            event_buffer: 64,
            answer_constraints: MediaConstraints::receive_all(),
        }
    }
}

impl SignalingConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn from_json_str(text: &str) -> Result<Self, SignalingError> {
        let config: SignalingConfig =
            serde_json::from_str(text).map_err(|e| SignalingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SignalingError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SignalingError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), SignalingError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(SignalingError::Config(format!(
                    "ICE server `{}` has an empty URL",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(SignalingError::Config(format!(
                    "TURN server `{}` requires username and credential",
                    server.id
                )));
            }
        }
        if self.command_buffer == 0 || self.event_buffer == 0 {
            return Err(SignalingError::Config("channel capacities must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = SignalingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period(), GRACE_PERIOD);
        assert!(config.answer_constraints.receive_audio);
        assert!(config.answer_constraints.receive_video);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SignalingConfig::from_json_str(r#"{ "grace_period_ms": 250 }"#).unwrap();
        assert_eq!(config.grace_period(), Duration::from_millis(250));
        assert_eq!(config.ice_servers.len(), DEFAULT_ICE_SERVERS.len());
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let text = r#"{
            "ice_servers": [
                { "id": "relay", "type": "turn", "url": "relay.example.org:3478" }
            ]
        }"#;
        let err = SignalingConfig::from_json_str(text).unwrap_err();
        assert!(matches!(err, SignalingError::Config(_)));
    }

    #[test]
    fn empty_url_is_rejected() {
        let text = r#"{ "ice_servers": [ { "id": "x", "type": "stun", "url": "" } ] }"#;
        assert!(SignalingConfig::from_json_str(text).is_err());
    }
}
