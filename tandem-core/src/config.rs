use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub webrtc: WebRTCConfig,
    pub chat: ChatConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling server
    pub url: String,
    /// Room to join
    pub room_id: String,
    /// Connection id to announce; generated when absent
    pub peer_id: Option<String>,
    /// Name shown next to our chat messages
    pub display_name: String,
    pub connect_timeout_seconds: u64,
    /// Keep-alive ping interval (0 = disabled)
    pub ping_interval_seconds: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            room_id: "lobby".to_string(),
            peer_id: None,
            display_name: "anonymous".to_string(),
            connect_timeout_seconds: 10,
            ping_interval_seconds: 25,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    #[must_use]
    pub const fn ping_interval(&self) -> Option<Duration> {
        if self.ping_interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.ping_interval_seconds))
        }
    }
}

/// WebRTC configuration for the media engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRTCConfig {
    /// STUN server URLs for NAT traversal
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn: Option<TurnConfig>,
    /// Label of the ordered chat data channel
    pub data_channel_label: String,
    /// Capture devices available for video; switching needs more than one
    pub video_devices: Vec<String>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn: None,
            data_channel_label: "chat".to_string(),
            video_devices: Vec::new(),
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// TURN server URL
    pub server_url: String,
    /// TURN username
    pub username: String,
    /// TURN password
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Longest accepted chat body, in characters
    pub max_message_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (TANDEM_SIGNALING__ROOM_ID, etc.)
        builder = builder.add_source(
            Environment::with_prefix("TANDEM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let url = self.signaling.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            errors.push(format!(
                "signaling.url must be a ws:// or wss:// URL, got '{url}'"
            ));
        }
        if self.signaling.room_id.trim().is_empty() {
            errors.push("signaling.room_id must not be empty".to_string());
        }
        if matches!(&self.signaling.peer_id, Some(id) if id.trim().is_empty()) {
            errors.push("signaling.peer_id must not be blank when set".to_string());
        }
        if self.signaling.connect_timeout_seconds == 0 {
            errors.push("signaling.connect_timeout_seconds must be greater than 0".to_string());
        }

        for server in &self.webrtc.stun_servers {
            if !(server.starts_with("stun:") || server.starts_with("stuns:")) {
                errors.push(format!("webrtc.stun_servers entry '{server}' is not a stun: URL"));
            }
        }
        if let Some(turn) = &self.webrtc.turn {
            if !(turn.server_url.starts_with("turn:") || turn.server_url.starts_with("turns:")) {
                errors.push(format!(
                    "webrtc.turn.server_url '{}' is not a turn: URL",
                    turn.server_url
                ));
            }
        }
        if self.webrtc.data_channel_label.trim().is_empty() {
            errors.push("webrtc.data_channel_label must not be empty".to_string());
        }

        if self.chat.max_message_length == 0 {
            errors.push("chat.max_message_length must be greater than 0".to_string());
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.signaling.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.signaling.ping_interval(), Some(Duration::from_secs(25)));
        assert!(!config.webrtc.stun_servers.is_empty());
        assert!(config.webrtc.turn.is_none());
        assert_eq!(config.webrtc.data_channel_label, "chat");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ping_interval_disabled() {
        let signaling = SignalingConfig {
            ping_interval_seconds: 0,
            ..SignalingConfig::default()
        };
        assert!(signaling.ping_interval().is_none());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.signaling.url = "http://example.com".to_string();
        config.signaling.room_id = " ".to_string();
        config.signaling.connect_timeout_seconds = 0;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("signaling.url")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_validate_turn_url() {
        let mut config = Config::default();
        config.webrtc.turn = Some(TurnConfig {
            server_url: "stun:relay.example.com".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        });

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("webrtc.turn.server_url"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "signaling:\n  url: wss://signal.example.com/ws\n  room_id: standup\n  peer_id: alice\nchat:\n  max_message_length: 64\n"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.signaling.url, "wss://signal.example.com/ws");
        assert_eq!(config.signaling.room_id, "standup");
        assert_eq!(config.signaling.peer_id.as_deref(), Some("alice"));
        assert_eq!(config.chat.max_message_length, 64);
        // Untouched sections keep their defaults
        assert_eq!(config.logging.level, "info");
    }
}
