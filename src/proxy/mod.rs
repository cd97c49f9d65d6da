//! Transparent proxy lifecycle
//!
//! Starts the TCP and UDP listeners for every bind address and hands each
//! intercepted flow to its own task. Flows never share state beyond the
//! read-only [`ProxyContext`].

mod tcp;
mod udp;

pub use tcp::handle_tcp_flow;
pub use udp::{handle_udp_flow, serve_udp_flow, FlowKey, FlowTable};

use crate::config::Config;
use crate::error::TproxyError;
use crate::socks::Socks5Client;
use crate::tproxy::{listen_tcp, listen_udp};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(50);

/// Everything a flow handler needs
///
/// Built once and shared read-only by all listeners.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    /// Upstream SOCKS5 client
    pub client: Socks5Client,
    /// Idle deadline for TCP bridges
    pub tcp_idle: Option<Duration>,
    /// Idle deadline for UDP bridges
    pub udp_idle: Option<Duration>,
}

impl ProxyContext {
    /// Build a context from a validated configuration
    pub fn new(config: &Config) -> Self {
        ProxyContext {
            client: Socks5Client::new(config.socks.clone()),
            tcp_idle: config.proxy.tcp_idle_timeout(),
            udp_idle: config.proxy.udp_idle_timeout(),
        }
    }
}

/// Listen on `bind` for both TCP and UDP and spawn the serving loops
///
/// Must be called from within a tokio runtime. Fails with
/// [`TproxyError::Listen`] if either socket cannot be set up; nothing is
/// left running for this address in that case.
pub fn start_listening(
    bind: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> Result<Vec<JoinHandle<()>>, TproxyError> {
    let tcp_listener = listen_tcp(bind)?;
    let udp_socket = listen_udp(bind)?;

    Ok(vec![
        tokio::spawn(tcp::run_tcp_listener(tcp_listener, ctx.clone())),
        tokio::spawn(udp::run_udp_listener(udp_socket, ctx)),
    ])
}

/// Run the proxy until a shutdown signal arrives
///
/// A bind address that cannot be listened on is logged and skipped; this
/// only fails when no address could be listened on at all. On shutdown the
/// listeners and all of their flows are stopped before this returns.
pub async fn run_proxy(config: Config, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    config.validate()?;
    let binds = config.proxy.bind_addrs().map_err(anyhow::Error::msg)?;
    let ctx = Arc::new(ProxyContext::new(&config));

    let mut tasks = Vec::new();
    for bind in binds {
        match start_listening(bind, ctx.clone()) {
            Ok(handles) => tasks.extend(handles),
            Err(e) => error!("{}", e),
        }
    }

    if tasks.is_empty() {
        anyhow::bail!("No listener could be started");
    }

    info!("Forwarding intercepted traffic to SOCKS5 server {}", config.socks.server);

    let _ = shutdown_rx.recv().await;
    info!("Shutdown signal received, stopping listeners");

    // Each loop owns its flow tasks, so aborting the loops ends every flow.
    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }

    info!("Proxy stopped");
    Ok(())
}
