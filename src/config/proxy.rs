//! Listener configuration
//!
//! Defines the bind addresses and idle timeouts of the transparent listeners.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default UDP idle timeout in seconds
fn default_udp_idle_timeout() -> u64 {
    10
}

/// Transparent listener configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Local bind addresses, each listened on for both TCP and UDP
    #[serde(default)]
    pub bind: Vec<String>,

    /// TCP bridge idle timeout in seconds (0 disables it)
    #[serde(default)]
    pub tcp_idle_timeout: u64,

    /// UDP bridge idle timeout in seconds (0 disables it)
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind: Vec::new(),
            tcp_idle_timeout: 0,
            udp_idle_timeout: default_udp_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    /// Parse the configured bind addresses
    pub fn bind_addrs(&self) -> Result<Vec<SocketAddr>, String> {
        self.bind
            .iter()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| format!("Invalid bind address {:?}: {}", addr, e))
            })
            .collect()
    }

    /// Idle deadline applied to TCP bridges
    pub fn tcp_idle_timeout(&self) -> Option<Duration> {
        secs_to_timeout(self.tcp_idle_timeout)
    }

    /// Idle deadline applied to UDP bridges
    pub fn udp_idle_timeout(&self) -> Option<Duration> {
        secs_to_timeout(self.udp_idle_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.bind.is_empty() {
            return Err("At least one bind address is required".to_string());
        }
        self.bind_addrs().map(|_| ())
    }
}

fn secs_to_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
