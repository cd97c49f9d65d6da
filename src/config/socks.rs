//! Upstream SOCKS5 server configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default SOCKS5 server address
fn default_server() -> String {
    "127.0.0.1:1080".to_string()
}

/// Default connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// Upstream SOCKS5 server configuration
///
/// Built once at startup and shared read-only by every listener.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SocksServerConfig {
    /// SOCKS5 server address (e.g., "127.0.0.1:1080")
    #[serde(default = "default_server")]
    pub server: String,

    /// Username for SOCKS5 auth
    #[serde(default)]
    pub username: Option<String>,

    /// Password for SOCKS5 auth
    #[serde(default)]
    pub password: Option<String>,

    /// Timeout in seconds for dialing and negotiating with the server
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for SocksServerConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            username: None,
            password: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl SocksServerConfig {
    /// Create a configuration for `server` without credentials
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Default::default()
        }
    }

    /// Attach username/password credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Check if a username is configured
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.is_empty() {
            return Err("SOCKS5 server address is empty".to_string());
        }
        if let Some(username) = &self.username {
            if username.is_empty() || username.len() > 255 {
                return Err(format!(
                    "SOCKS5 username must be 1-255 bytes, got {}",
                    username.len()
                ));
            }
        }
        if let Some(password) = &self.password {
            if self.username.is_none() {
                return Err("SOCKS5 password configured without a username".to_string());
            }
            if password.len() > 255 {
                return Err(format!(
                    "SOCKS5 password must be at most 255 bytes, got {}",
                    password.len()
                ));
            }
        }
        if self.connect_timeout == 0 {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}
