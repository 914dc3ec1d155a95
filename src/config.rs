//! Agentdeck configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main agentdeck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentdeckConfig {
    /// Remote agent server configuration
    pub server: ServerConfig,

    /// WebSocket transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Event dispatcher configuration
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// In-memory buffer limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Remote agent server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the agent server (http or https)
    pub base_url: String,

    /// Bearer token attached to API requests when present
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Default request timeout in seconds
    pub request_timeout_secs: u64,

    /// Timeout for session creation in seconds.
    ///
    /// Creating a session can take minutes while the remote agent loads
    /// models and warms its memory stores, so this is separate from the
    /// ordinary request timeout.
    pub session_create_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            auth_token: None,
            request_timeout_secs: 30,
            session_create_timeout_secs: 300,
        }
    }
}

impl ServerConfig {
    /// Default request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Session creation timeout as a `Duration`
    pub fn session_create_timeout(&self) -> Duration {
        Duration::from_secs(self.session_create_timeout_secs)
    }
}

/// WebSocket transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Timeout for the initial socket open in seconds
    pub connect_timeout_secs: u64,

    /// Maximum automatic reconnect attempts before giving up (5-10)
    pub max_reconnect_attempts: u32,

    /// Base reconnect delay in milliseconds
    pub reconnect_base_delay_ms: u64,

    /// Backoff multiplier cap: delay = base * min(attempt + 1, cap)
    pub reconnect_delay_cap: u32,

    /// Heartbeat period in seconds (half the server's liveness timeout)
    pub heartbeat_interval_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1000,
            reconnect_delay_cap: 5,
            heartbeat_interval_secs: 30,
        }
    }
}

impl TransportConfig {
    /// Initial connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Base reconnect delay as a `Duration`
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Heartbeat period as a `Duration`
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Event dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Suppress duplicate handler registrations.
    ///
    /// Off by default: registering the same handler twice under one tag
    /// invokes it twice, matching the historical dispatch behavior some
    /// callers rely on. Turn on to make repeat registrations a no-op.
    pub dedup_handlers: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_handlers: false,
        }
    }
}

/// In-memory buffer limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum retained chat messages (oldest evicted)
    pub max_chat_messages: usize,

    /// Maximum retained log entries (oldest evicted)
    pub max_log_entries: usize,

    /// Maximum retained verbose status messages (oldest evicted)
    pub max_verbose_messages: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_chat_messages: 500,
            max_log_entries: 1000,
            max_verbose_messages: 1000,
        }
    }
}

impl AgentdeckConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.is_empty() {
            return Err(Error::Config("server.base_url must not be empty".to_string()));
        }
        if !(5..=10).contains(&self.transport.max_reconnect_attempts) {
            return Err(Error::Config(format!(
                "transport.max_reconnect_attempts must be in 5..=10, got {}",
                self.transport.max_reconnect_attempts
            )));
        }
        if self.transport.reconnect_delay_cap == 0 {
            return Err(Error::Config(
                "transport.reconnect_delay_cap must be at least 1".to_string(),
            ));
        }
        if self.transport.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "transport.heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default configuration file path (`<config dir>/agentdeck/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join("agentdeck").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentdeckConfig::default();
        assert_eq!(config.server.base_url, "http://localhost:8000");
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.transport.heartbeat_interval_secs, 30);
        assert!(!config.dispatcher.dedup_handlers);
        assert_eq!(config.limits.max_log_entries, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = AgentdeckConfig::default();
        config.server.auth_token = Some("tok-123".to_string());
        config.transport.max_reconnect_attempts = 8;

        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: AgentdeckConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.server.auth_token.as_deref(), Some("tok-123"));
        assert_eq!(parsed.transport.max_reconnect_attempts, 8);
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let parsed: AgentdeckConfig = toml::from_str(
            r#"
            [server]
            base_url = "https://agents.example.com"
            request_timeout_secs = 15
            session_create_timeout_secs = 120
            "#,
        )
        .unwrap();
        assert_eq!(parsed.server.base_url, "https://agents.example.com");
        assert_eq!(parsed.transport.connect_timeout_secs, 10);
        assert_eq!(parsed.limits.max_chat_messages, 500);
    }

    #[test]
    fn test_validate_rejects_attempt_range() {
        let mut config = AgentdeckConfig::default();
        config.transport.max_reconnect_attempts = 3;
        assert!(config.validate().is_err());

        config.transport.max_reconnect_attempts = 11;
        assert!(config.validate().is_err());

        config.transport.max_reconnect_attempts = 10;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let mut config = AgentdeckConfig::default();
        config.transport.reconnect_delay_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            base_url = "http://127.0.0.1:9000"
            request_timeout_secs = 30
            session_create_timeout_secs = 300

            [transport]
            connect_timeout_secs = 5
            max_reconnect_attempts = 6
            reconnect_base_delay_ms = 500
            reconnect_delay_cap = 4
            heartbeat_interval_secs = 20
            "#,
        )
        .unwrap();

        let config = AgentdeckConfig::load(&path).unwrap();
        assert_eq!(config.server.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.transport.max_reconnect_attempts, 6);
        assert_eq!(config.transport.reconnect_base_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();
        assert!(AgentdeckConfig::load(&path).is_err());
    }
}
