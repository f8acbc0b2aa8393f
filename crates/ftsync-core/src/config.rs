//! Fault tolerance configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default interval between steady-state memory rounds
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(50);

/// Default standby port
pub const DEFAULT_PORT: u16 = 6000;

/// Default receive buffer for command and reply lines
pub const DEFAULT_MAX_LINE_LENGTH: usize = 256;

/// Node role in the fault tolerance pair
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Running VM whose state is replicated; initiates the connection
    #[default]
    Master,
    /// Passive replica; listens and applies state
    Standby,
}

impl Role {
    /// Lowercase name used in logs and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Standby => "standby",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "standby" => Ok(Role::Standby),
            other => Err(Error::config(format!("unknown role '{}'", other))),
        }
    }
}

/// Power-on parameters of a fault tolerant VM
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FtmConfig {
    /// This node's role
    pub role: Role,

    /// Steady-state memory sync cadence (0 selects the default)
    #[serde(rename = "sync_interval_ms", with = "serde_millis")]
    pub sync_interval: Duration,

    /// Standby address (connect target for the master, bind address for the standby)
    pub address: String,

    /// Standby port
    pub port: u16,

    /// Shared secret sent after the welcome banner
    pub password: Option<String>,

    /// Timeout for a single outbound connect attempt
    #[serde(rename = "connect_timeout_ms", with = "serde_millis")]
    pub connect_timeout: Duration,

    /// Wait between connection attempts (also the shutdown poll on retry)
    #[serde(rename = "retry_delay_ms", with = "serde_millis")]
    pub retry_delay: Duration,

    /// Poll interval of blocking stream reads; bounds cancellation latency
    #[serde(rename = "read_poll_interval_ms", with = "serde_millis")]
    pub read_poll_interval: Duration,

    /// Receive buffer for command and reply lines
    pub max_line_length: usize,
}

impl Default for FtmConfig {
    fn default() -> Self {
        Self {
            role: Role::Master,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            password: None,
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(1),
            read_poll_interval: Duration::from_secs(1),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl FtmConfig {
    /// Create a master configuration targeting the given standby
    pub fn master(address: impl Into<String>, port: u16) -> Self {
        Self {
            role: Role::Master,
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    /// Create a standby configuration listening on the given address
    pub fn standby(address: impl Into<String>, port: u16) -> Self {
        Self {
            role: Role::Standby,
            address: address.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the shared password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the steady-state sync interval (zero selects the default)
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the delay between connection attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the stream read poll interval
    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = interval;
        self
    }

    /// Password bytes exchanged during the handshake (empty when unset)
    pub fn password_bytes(&self) -> &[u8] {
        self.password.as_deref().unwrap_or("").as_bytes()
    }

    /// Sync interval with the zero-means-default rule applied
    pub fn effective_sync_interval(&self) -> Duration {
        if self.sync_interval.is_zero() {
            DEFAULT_SYNC_INTERVAL
        } else {
            self.sync_interval
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::config("address must not be empty"));
        }
        if self.role == Role::Master && self.port == 0 {
            return Err(Error::config("master requires a non-zero standby port"));
        }
        if self.read_poll_interval.is_zero() {
            return Err(Error::config("read_poll_interval must be non-zero"));
        }
        if self.retry_delay.is_zero() {
            return Err(Error::config("retry_delay must be non-zero"));
        }
        if let Some(password) = &self.password {
            if password.contains('\n') {
                return Err(Error::config("password must not contain a newline"));
            }
            if password.len() >= self.max_line_length {
                return Err(Error::config("password exceeds max_line_length"));
            }
        }
        if self.max_line_length < 16 {
            return Err(Error::config("max_line_length must be at least 16"));
        }
        Ok(())
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid TOML: {}", e)))
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("Loaded fault tolerance configuration from {:?}", path);
        Ok(config)
    }

    /// Apply `FTSYNC_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Unparseable values are logged and the current value is kept.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(role) = lookup("FTSYNC_ROLE") {
            match role.parse() {
                Ok(role) => self.role = role,
                Err(e) => tracing::warn!("Ignoring FTSYNC_ROLE: {}", e),
            }
        }

        if let Some(address) = lookup("FTSYNC_ADDRESS") {
            self.address = address;
        }

        if let Some(port) = lookup("FTSYNC_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(e) => tracing::warn!("Ignoring FTSYNC_PORT={:?}: {}", port, e),
            }
        }

        if let Some(interval) = lookup("FTSYNC_INTERVAL_MS") {
            match interval.parse() {
                Ok(ms) => self.sync_interval = Duration::from_millis(ms),
                Err(e) => tracing::warn!("Ignoring FTSYNC_INTERVAL_MS={:?}: {}", interval, e),
            }
        }

        // Docker secrets: the file variant wins over the inline password
        if let Some(password_file) = lookup("FTSYNC_PASSWORD_FILE") {
            match std::fs::read_to_string(&password_file) {
                Ok(password) => self.password = Some(password.trim().to_string()),
                Err(e) => tracing::warn!("Failed to read {:?}: {}", password_file, e),
            }
        } else if let Some(password) = lookup("FTSYNC_PASSWORD") {
            self.password = Some(password);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = FtmConfig::default();
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.sync_interval, Duration::from_millis(50));
        assert_eq!(config.read_poll_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_master_and_standby_builders() {
        let master = FtmConfig::master("127.0.0.1", 6000).with_password("pw");
        assert_eq!(master.role, Role::Master);
        assert_eq!(master.password_bytes(), b"pw");

        let standby = FtmConfig::standby("0.0.0.0", 0);
        assert_eq!(standby.role, Role::Standby);
        assert!(standby.password_bytes().is_empty());
        assert!(standby.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_selects_default() {
        let config = FtmConfig::master("127.0.0.1", 6000).with_sync_interval(Duration::ZERO);
        assert_eq!(config.effective_sync_interval(), DEFAULT_SYNC_INTERVAL);
    }

    #[test]
    fn test_master_without_port() {
        let config = FtmConfig::master("127.0.0.1", 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_password_with_newline_rejected() {
        let config = FtmConfig::standby("127.0.0.1", 6000).with_password("a\nb");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = FtmConfig::from_toml_str(
            r#"
            role = "standby"
            address = "10.0.0.2"
            port = 7000
            password = "secret"
            sync_interval_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.role, Role::Standby);
        assert_eq!(config.address, "10.0.0.2");
        assert_eq!(config.port, 7000);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.sync_interval, Duration::from_millis(100));
        // Unspecified fields fall back to defaults
        assert_eq!(config.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("FTSYNC_ROLE", "standby"),
            ("FTSYNC_PORT", "6100"),
            ("FTSYNC_INTERVAL_MS", "not-a-number"),
            ("FTSYNC_PASSWORD", "from-env"),
        ]
        .into_iter()
        .collect();

        let mut config = FtmConfig::default();
        config.apply_env_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.role, Role::Standby);
        assert_eq!(config.port, 6100);
        assert_eq!(config.sync_interval, DEFAULT_SYNC_INTERVAL);
        assert_eq!(config.password.as_deref(), Some("from-env"));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Master".parse::<Role>().unwrap(), Role::Master);
        assert_eq!(" standby ".parse::<Role>().unwrap(), Role::Standby);
        assert!("replica".parse::<Role>().is_err());
    }
}
