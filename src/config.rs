//! Konfiguration der Call Engine
//!
//! Quellen in aufsteigender Priorität: Defaults, `config.json` im
//! App-Konfigurationsverzeichnis, Umgebungsvariablen.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

/// Standard-Wartezeit bis ein unbeantworteter Anruf beendet wird
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_SIGNALING_URL: &str = "https://call-app-signaling.questxen.workers.dev/ws";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Ein STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Welche Kandidaten für die Verbindung erlaubt sind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IcePolicy {
    #[default]
    All,
    Relay,
}

impl From<IcePolicy> for RTCIceTransportPolicy {
    fn from(policy: IcePolicy) -> Self {
        match policy {
            IcePolicy::All => RTCIceTransportPolicy::All,
            IcePolicy::Relay => RTCIceTransportPolicy::Relay,
        }
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServerConfig {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            username: None,
            credential: None,
        },
    ]
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling_url: String,
    #[serde(with = "duration_secs")]
    pub ring_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    pub ice_servers: Vec<IceServerConfig>,
    pub ice_transport_policy: IcePolicy,
    pub data_channel_label: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ring_timeout: DEFAULT_RING_TIMEOUT,
            heartbeat_interval: Duration::from_secs(25),
            ice_servers: default_ice_servers(),
            ice_transport_policy: IcePolicy::All,
            data_channel_label: "chat".to_string(),
        }
    }
}

impl CallConfig {
    /// Lädt die Konfiguration aus Datei und Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading call config from {:?}", path);
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Liest eine JSON-Konfigurationsdatei (fehlende Felder = Default)
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Fügt einen TURN-Server hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(IceServerConfig {
            urls: vec![url],
            username: Some(username),
            credential: Some(credential),
        });
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }

    /// Überschreibt Werte aus Umgebungsvariablen
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = var("SIGNALING_URL") {
            self.signaling_url = url;
        }

        if let Some(value) = var("CALL_RING_TIMEOUT_SECS") {
            let secs: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                name: "CALL_RING_TIMEOUT_SECS",
                value: value.clone(),
            })?;
            self.ring_timeout = Duration::from_secs(secs);
        }

        if let Some(url) = var("TURN_URL") {
            let username = var("TURN_USERNAME").unwrap_or_default();
            let credential = var("TURN_CREDENTIAL").unwrap_or_default();
            self.add_turn_server(url, username, credential);
        }

        Ok(())
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "pulse", "pulse-call")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout, Duration::from_secs(30));
        assert_eq!(config.ice_transport_policy, IcePolicy::All);
        assert_eq!(config.rtc_ice_servers()[0].urls.len(), 3);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: CallConfig = serde_json::from_str(
            r#"{"ring_timeout": 45, "ice_transport_policy": "relay",
                "ice_servers": [{"urls": ["turn:turn.example.com:3478"], "username": "u", "credential": "p"}]}"#,
        )
        .unwrap();

        assert_eq!(config.ring_timeout, Duration::from_secs(45));
        assert_eq!(config.ice_transport_policy, IcePolicy::Relay);
        assert_eq!(config.data_channel_label, "chat");

        let rtc = config.rtc_ice_servers();
        assert_eq!(rtc[0].username, "u");
        assert_eq!(rtc[0].credential, "p");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SIGNALING_URL", "wss://relay.local/ws"),
            ("CALL_RING_TIMEOUT_SECS", "10"),
            ("TURN_URL", "turn:turn.local:3478"),
            ("TURN_USERNAME", "chr"),
        ]);

        let mut config = CallConfig::default();
        config
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.signaling_url, "wss://relay.local/ws");
        assert_eq!(config.ring_timeout, Duration::from_secs(10));
        let turn = config.ice_servers.last().unwrap();
        assert_eq!(turn.urls, vec!["turn:turn.local:3478".to_string()]);
        assert_eq!(turn.username.as_deref(), Some("chr"));
        assert_eq!(turn.credential.as_deref(), Some(""));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = CallConfig::default();
        let result = config.apply_env(|name| {
            (name == "CALL_RING_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnv { .. })));
    }
}
