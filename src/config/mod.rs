//! Configuration module for tproxy2socks
//!
//! This module provides configuration types and parsing. Configuration can
//! come from a TOML file, command-line overrides, or both.

mod proxy;
mod socks;

pub use proxy::ProxyConfig;
pub use socks::SocksServerConfig;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Config {
    /// Transparent listener configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Upstream SOCKS5 server configuration
    #[serde(default)]
    pub socks: SocksServerConfig,
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate().map_err(anyhow::Error::msg)?;
        self.socks.validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
