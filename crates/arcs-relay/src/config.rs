//! Configuration management

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The placeholder secret shipped in defaults. Startup refuses to run
/// with it.
const DEFAULT_TOKEN_SECRET: &str = "change-me";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// HS256 signing secret for session tokens. Must be overridden.
    pub token_secret: String,
    pub token_expiry_hours: u64,
    pub max_sessions: usize,
    /// SQLite file backing the device registry.
    pub registry_path: PathBuf,
    /// Append-only audit log file.
    pub audit_log_path: PathBuf,
    pub idle_session_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Per-controller frame FIFO depth; about one second at 30 fps.
    pub max_frame_queue: usize,
    /// Advertised to controllers in `video_config`.
    pub max_packet_size: usize,
    /// Bounded per-connection send channel depth.
    pub send_queue_depth: usize,
    /// TLS is optional; deployments may terminate at a proxy instead.
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8440".parse().unwrap(),
            token_secret: DEFAULT_TOKEN_SECRET.to_string(),
            token_expiry_hours: 24,
            max_sessions: 256,
            registry_path: PathBuf::from("arcs-devices.db"),
            audit_log_path: PathBuf::from("arcs-audit.log"),
            idle_session_timeout_secs: 300,
            sweep_interval_secs: 30,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_frame_queue: 30,
            max_packet_size: 65536,
            send_queue_depth: 64,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from defaults, an optional TOML file, and the
    /// process environment. Environment wins.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ARCS_RELAY_CONFIG") {
            config.load_from_toml(&path)?;
        }

        config.load_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration. The token secret is required: startup is
    /// refused while the shipped default is still in place.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_secret.is_empty() || self.token_secret == DEFAULT_TOKEN_SECRET {
            return Err(ConfigError::Invalid(
                "token_secret must be set (ARCS_RELAY_TOKEN_SECRET)".to_string(),
            ));
        }

        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid("max_sessions must be > 0".to_string()));
        }

        if self.max_frame_queue == 0 {
            return Err(ConfigError::Invalid("max_frame_queue must be > 0".to_string()));
        }

        // Smallest useful packet: fragment header plus CRC plus one byte.
        let min_packet = arcs_proto::frame::HEADER_LEN
            + arcs_proto::frame::FRAGMENT_EXT_LEN
            + arcs_proto::frame::CRC_LEN
            + 1;
        if self.max_packet_size < min_packet {
            return Err(ConfigError::Invalid(format!(
                "max_packet_size must be >= {min_packet}"
            )));
        }

        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_secs must exceed heartbeat_interval_secs".to_string(),
            ));
        }

        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "tls_cert_path and tls_key_path must be set together".to_string(),
                ));
            }
            _ => {}
        }

        Ok(())
    }

    fn load_from_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var("ARCS_RELAY_LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr: {e}")))?;
        }
        if let Ok(secret) = std::env::var("ARCS_RELAY_TOKEN_SECRET") {
            self.token_secret = secret;
        }
        if let Ok(hours) = std::env::var("ARCS_RELAY_TOKEN_EXPIRY_HOURS") {
            self.token_expiry_hours = hours
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid token_expiry_hours: {e}")))?;
        }
        if let Ok(max) = std::env::var("ARCS_RELAY_MAX_SESSIONS") {
            self.max_sessions = max
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid max_sessions: {e}")))?;
        }
        if let Ok(path) = std::env::var("ARCS_RELAY_REGISTRY_PATH") {
            self.registry_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ARCS_RELAY_AUDIT_LOG_PATH") {
            self.audit_log_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ARCS_RELAY_TLS_CERT_PATH") {
            self.tls_cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("ARCS_RELAY_TLS_KEY_PATH") {
            self.tls_key_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn load_from_toml(&mut self, path: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let value: toml::Value = toml::from_str(&content)?;

        if let Some(addr) = value.get("listen_addr").and_then(|v| v.as_str()) {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr in TOML: {e}")))?;
        }
        if let Some(secret) = value.get("token_secret").and_then(|v| v.as_str()) {
            self.token_secret = secret.to_string();
        }
        if let Some(hours) = value.get("token_expiry_hours").and_then(|v| v.as_integer()) {
            self.token_expiry_hours = hours as u64;
        }
        if let Some(max) = value.get("max_sessions").and_then(|v| v.as_integer()) {
            self.max_sessions = max as usize;
        }
        if let Some(path) = value.get("registry_path").and_then(|v| v.as_str()) {
            self.registry_path = PathBuf::from(path);
        }
        if let Some(path) = value.get("audit_log_path").and_then(|v| v.as_str()) {
            self.audit_log_path = PathBuf::from(path);
        }
        if let Some(secs) = value
            .get("idle_session_timeout_secs")
            .and_then(|v| v.as_integer())
        {
            self.idle_session_timeout_secs = secs as u64;
        }
        if let Some(secs) = value.get("sweep_interval_secs").and_then(|v| v.as_integer()) {
            self.sweep_interval_secs = secs as u64;
        }
        if let Some(secs) = value
            .get("heartbeat_interval_secs")
            .and_then(|v| v.as_integer())
        {
            self.heartbeat_interval_secs = secs as u64;
        }
        if let Some(secs) = value
            .get("heartbeat_timeout_secs")
            .and_then(|v| v.as_integer())
        {
            self.heartbeat_timeout_secs = secs as u64;
        }
        if let Some(depth) = value.get("max_frame_queue").and_then(|v| v.as_integer()) {
            self.max_frame_queue = depth as usize;
        }
        if let Some(size) = value.get("max_packet_size").and_then(|v| v.as_integer()) {
            self.max_packet_size = size as usize;
        }
        if let Some(path) = value.get("tls_cert_path").and_then(|v| v.as_str()) {
            self.tls_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = value.get("tls_key_path").and_then(|v| v.as_str()) {
            self.tls_key_path = Some(PathBuf::from(path));
        }

        Ok(())
    }

    pub fn idle_session_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RelayConfig {
        RelayConfig {
            token_secret: "unit-test-secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_secret_rejected() {
        let config = RelayConfig::default();
        assert!(config.validate().is_err());

        let mut empty = valid_config();
        empty.token_secret.clear();
        assert!(empty.validate().is_err());

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_heartbeat_ordering_enforced() {
        let mut config = valid_config();
        config.heartbeat_interval_secs = 90;
        config.heartbeat_timeout_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_paths_must_pair() {
        let mut config = valid_config();
        config.tls_cert_path = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());
        config.tls_key_path = Some(PathBuf::from("key.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            r#"
listen_addr = "127.0.0.1:9000"
token_secret = "from-toml"
max_sessions = 8
idle_session_timeout_secs = 60
"#,
        )
        .unwrap();

        let mut config = RelayConfig::default();
        config.load_from_toml(path.to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.token_secret, "from-toml");
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.idle_session_timeout_secs, 60);
        assert!(config.validate().is_ok());
    }
}
