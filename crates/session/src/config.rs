//! Session configuration.
//!
//! The config document keeps the key spelling used by deployed lobby
//! servers (`"ice servers"`, `"max players"`, `"API version"`), so a file
//! that drives an existing lobby drives this runtime unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a [`NetConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Address of the lobby server brokering rooms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyConfig {
    pub address: String,
    pub port: u16,
}

/// A STUN or TURN server used while negotiating peer connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub turn: bool,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Connection settings handed to the transport when a session opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    pub lobby: LobbyConfig,
    #[serde(rename = "ice servers", default)]
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(rename = "max players")]
    pub max_players: u32,
    #[serde(rename = "API version")]
    pub api_version: u32,
}

impl NetConfig {
    /// Minimal config pointing at one lobby, with no ICE servers.
    pub fn new(address: impl Into<String>, port: u16, max_players: u32) -> Self {
        Self {
            lobby: LobbyConfig {
                address: address.into(),
                port,
            },
            ice_servers: Vec::new(),
            max_players,
            api_version: 1,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Key identifying the lobby this config points at.
    pub fn lobby_key(&self) -> String {
        format!("{}:{}", self.lobby.address, self.lobby.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_lobby_document() {
        let json = r#"{
            "lobby": { "address": "10.0.0.1", "port": 8000 },
            "ice servers": [
                { "turn": false, "address": "stun.example.com", "port": 3478 },
                {
                    "turn": true,
                    "address": "turn.example.com",
                    "port": 3478,
                    "username": "user",
                    "password": "hunter2"
                }
            ],
            "max players": 4,
            "API version": 2
        }"#;

        let config = NetConfig::from_json_str(json).unwrap();
        assert_eq!(config.lobby.address, "10.0.0.1");
        assert_eq!(config.lobby.port, 8000);
        assert_eq!(config.ice_servers.len(), 2);
        assert!(!config.ice_servers[0].turn);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("user"));
        assert_eq!(config.max_players, 4);
        assert_eq!(config.api_version, 2);
        assert_eq!(config.lobby_key(), "10.0.0.1:8000");
    }

    #[test]
    fn ice_servers_are_optional() {
        let json = r#"{
            "lobby": { "address": "localhost", "port": 9000 },
            "max players": 2,
            "API version": 1
        }"#;
        let config = NetConfig::from_json_str(json).unwrap();
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(NetConfig::from_json_str("{ not json").is_err());
        assert!(NetConfig::from_json_str(r#"{"lobby": {}}"#).is_err());
    }
}
