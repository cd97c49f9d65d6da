//! # tproxy2socks - Transparent proxy to SOCKS5 gateway
//!
//! tproxy2socks receives TCP connections and UDP datagrams redirected to it
//! by Linux TPROXY rules, recovers each flow's original destination, and
//! forwards the flow through an upstream SOCKS5 server.
//!
//! ## Features
//!
//! - **Transparent interception**: `IP_TRANSPARENT` listeners for TCP and UDP,
//!   IPv4 and IPv6
//! - **SOCKS5 client**: no-auth and username/password (RFC 1929), CONNECT and
//!   UDP ASSOCIATE
//! - **Transparent replies**: UDP answers leave from the original destination
//!   address, so clients never see the proxy
//! - **Per-flow isolation**: every flow owns its sockets and upstream session;
//!   a failing flow never affects its listener or other flows
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tproxy2socks::config::load_config;
//! use tproxy2socks::proxy::run_proxy;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_proxy(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! client --(TPROXY)--> tproxy listener --> bridge --> SOCKS5 server --> destination
//! ```
//!
//! TCP flows get a CONNECT session; UDP flows get a UDP ASSOCIATE session
//! whose relay datagrams carry the SOCKS5 UDP header.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod proxy;
pub mod relay;
pub mod socks;
pub mod tproxy;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{Socks5Error, TproxyError};
pub use proxy::run_proxy;

/// Version of the tproxy2socks library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
