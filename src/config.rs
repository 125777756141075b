//! Configuration types for peer sessions

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration for a peer session's transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// STUN server URLs (at least one server of either kind required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Label for the session's data channel
    pub channel_label: String,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478?transport=udp".to_string(),
                "stun:stun.stunprotocol.org".to_string(),
            ],
            turn_servers: Vec::new(),
            channel_label: "peerlink-data".to_string(),
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no STUN or TURN server is configured
    /// - a server URL is empty
    /// - a TURN server is missing its username or credential
    /// - the data channel label is empty
    pub fn validate(&self) -> Result<()> {
        if self.stun_servers.is_empty() && self.turn_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one STUN or TURN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if url.is_empty() {
                return Err(Error::InvalidConfig(
                    "STUN server URL cannot be empty".to_string(),
                ));
            }
        }

        for turn in &self.turn_servers {
            if turn.url.is_empty() {
                return Err(Error::InvalidConfig(
                    "TURN server URL cannot be empty".to_string(),
                ));
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    turn.url
                )));
            }
        }

        if self.channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "data channel label cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.stun_servers.is_empty());
        assert!(config.turn_servers.is_empty());
    }

    #[test]
    fn test_no_servers_rejected() {
        let config = SessionConfig {
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_turn_requires_credentials() {
        let config = SessionConfig {
            turn_servers: vec![TurnServerConfig {
                url: "turn:turn.example.com:3478".to_string(),
                username: String::new(),
                credential: String::new(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_channel_label_rejected() {
        let config = SessionConfig {
            channel_label: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.stun_servers, config.stun_servers);
        assert_eq!(parsed.channel_label, config.channel_label);
    }
}
