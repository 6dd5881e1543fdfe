//! Client-Konfiguration
//!
//! Relay-Endpunkt und ICE-Server: STUN-Defaults plus optionale
//! TURN-Zugangsdaten, die wie beim ursprünglichen Deployment als TCP- und
//! UDP-Variante eingetragen werden.

use thiserror::Error;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::call::CallMode;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl { url: String, reason: String },
}

// ============================================================================
// CONFIG TYPES
// ============================================================================

/// TURN-Zugangsdaten des Betreibers
#[derive(Debug, Clone)]
pub struct TurnServer {
    /// Host und Port, z.B. "turn.example.org:3478"
    pub host: String,
    pub username: String,
    pub credential: String,
}

/// Konfiguration des Clients
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// WebSocket-Endpunkt des Relays
    pub relay_url: String,

    /// STUN-Server für die Kandidaten-Suche
    pub stun_servers: Vec<String>,

    /// Optionaler TURN-Server (wird als TCP- und UDP-Transport eingetragen)
    pub turn: Option<TurnServer>,

    /// Modus-Tag für ausgehende Anrufe
    pub default_mode: CallMode,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:5000/ws".to_string(),
            // Google STUN Server (kostenlos, für ~90% der Verbindungen)
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn: None,
            default_mode: CallMode::Rotate,
        }
    }
}

impl CallConfig {
    /// Prüft den Relay-Endpunkt
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parsed = Url::parse(&self.relay_url).map_err(|e| ConfigError::InvalidRelayUrl {
            url: self.relay_url.clone(),
            reason: e.to_string(),
        })?;

        match parsed.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(ConfigError::InvalidRelayUrl {
                url: self.relay_url.clone(),
                reason: format!("unsupported scheme '{}'", other),
            }),
        }
    }

    /// Baut die ICE-Server-Liste für die Peer-Connection
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![RTCIceServer {
            urls: self.stun_servers.clone(),
            ..Default::default()
        }];

        if let Some(turn) = &self.turn {
            for transport in ["tcp", "udp"] {
                servers.push(RTCIceServer {
                    urls: vec![format!("turn:{}?transport={}", turn.host, transport)],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                });
            }
        }

        servers
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ice_servers().len(), 1);
        assert!(!config.ice_servers()[0].urls.is_empty());
    }

    #[test]
    fn test_turn_server_is_added_for_both_transports() {
        let config = CallConfig {
            turn: Some(TurnServer {
                host: "turn.example.org:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }),
            ..CallConfig::default()
        };

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 3);
        assert_eq!(
            servers[1].urls[0],
            "turn:turn.example.org:3478?transport=tcp"
        );
        assert_eq!(
            servers[2].urls[0],
            "turn:turn.example.org:3478?transport=udp"
        );
        assert_eq!(servers[1].username, "user");
    }

    #[test]
    fn test_non_websocket_scheme_is_rejected() {
        let config = CallConfig {
            relay_url: "https://relay.example.org".to_string(),
            ..CallConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_garbage_url_is_rejected() {
        let config = CallConfig {
            relay_url: "not a url".to_string(),
            ..CallConfig::default()
        };

        assert!(config.validate().is_err());
    }
}
