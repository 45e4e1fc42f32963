//! Connection configuration for local robot sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SdkError, SdkResult};

/// MQTT/TLS port every v2 robot listens on.
pub const DEFAULT_PORT: u16 = 8883;

/// OpenSSL-style cipher list used when nothing else is configured.
pub const DEFAULT_CIPHERS: &str = "AES128-SHA256";

/// Mission snapshot interval in milliseconds.
pub const DEFAULT_EMIT_INTERVAL_MS: u64 = 800;

/// Environment variable names
pub mod env_vars {
    pub const ROBOT_CIPHERS: &str = "ROBOT_CIPHERS";
    pub const ROBOT_BLID: &str = "ROBOT_BLID";
    pub const ROBOT_PASSWORD: &str = "ROBOT_PASSWORD";
    pub const ROBOT_IP: &str = "ROBOT_IP";
    pub const LOG_JSON: &str = "ROBOVAC_LOG_JSON";
}

/// Configuration for a local robot connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Robot address (IP or host name)
    pub host: String,

    /// Robot identity (blid), used as MQTT client id and username
    pub blid: String,

    /// Robot secret
    pub password: String,

    /// MQTT/TLS port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Colon separated cipher list
    #[serde(default = "default_ciphers")]
    pub ciphers: String,

    /// Mission snapshot interval; 0 means the default
    #[serde(default = "default_emit_interval_ms")]
    pub emit_interval_ms: u64,

    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// How long the initial connect may take
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound for read calls; none waits until the state arrives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_ciphers() -> String {
    DEFAULT_CIPHERS.to_string()
}
fn default_emit_interval_ms() -> u64 {
    DEFAULT_EMIT_INTERVAL_MS
}
fn default_keep_alive() -> u64 {
    60
}
fn default_connect_timeout() -> u64 {
    10
}

impl LocalConfig {
    pub fn new(
        blid: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            blid: blid.into(),
            password: password.into(),
            port: DEFAULT_PORT,
            ciphers: default_ciphers(),
            emit_interval_ms: DEFAULT_EMIT_INTERVAL_MS,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_ms: None,
        }
    }

    /// Same as [`LocalConfig::new`], with `ROBOT_CIPHERS` applied when set.
    pub fn from_env(
        blid: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self::new(blid, password, host).apply_env(|name| std::env::var(name).ok())
    }

    /// Apply environment overrides using a custom lookup.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ciphers) = lookup(env_vars::ROBOT_CIPHERS).filter(|c| !c.trim().is_empty()) {
            self.ciphers = ciphers;
        }
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_ciphers(mut self, ciphers: impl Into<String>) -> Self {
        self.ciphers = ciphers.into();
        self
    }

    pub fn with_emit_interval(mut self, interval: Duration) -> Self {
        self.emit_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive_secs = keep_alive.as_secs();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = Some(duration_ms(timeout));
        self
    }

    pub fn emit_interval(&self) -> Duration {
        match self.emit_interval_ms {
            0 => Duration::from_millis(DEFAULT_EMIT_INTERVAL_MS),
            ms => Duration::from_millis(ms),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn full_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject configurations a robot can never accept.
    pub fn validate(&self) -> SdkResult<()> {
        if self.blid.trim().is_empty() {
            return Err(SdkError::Configuration("robot blid is required".to_string()));
        }
        if self.blid.starts_with(char::is_whitespace) {
            return Err(SdkError::Configuration(
                "robot blid must not start with whitespace".to_string(),
            ));
        }
        if self.password.is_empty() {
            return Err(SdkError::Configuration("password is required".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(SdkError::Configuration("host is required".to_string()));
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
