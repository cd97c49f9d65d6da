//! Intercepted TCP connections

use super::{ProxyContext, ACCEPT_ERROR_DELAY};
use crate::error::TproxyError;
use crate::relay::{bridge_tcp, BridgeReport};
use crate::socks::TargetAddr;
use crate::tproxy::{accept_tcp, InterceptedFlow};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Accept loop for one transparent TCP listener
///
/// Flow tasks belong to this loop and are aborted when it is dropped.
pub(crate) async fn run_tcp_listener(listener: TcpListener, ctx: Arc<ProxyContext>) {
    let mut tasks = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            accepted = accept_tcp(&listener) => accepted,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
        };

        match accepted {
            Ok(flow) => {
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let (source, original_dst) = (flow.source, flow.original_dst);
                    if let Err(e) = handle_tcp_flow(flow, &ctx).await {
                        if e.is_timeout() {
                            debug!("tcp: {} -> {} timed out: {}", source, original_dst, e);
                        } else {
                            warn!("tcp: {} -> {} failed: {}", source, original_dst, e);
                        }
                    }
                });
            }
            Err(e) => {
                warn!("{}", e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
}

/// Forward one intercepted connection through a SOCKS5 CONNECT
///
/// The intercepted stream is closed on every path, including a failed
/// negotiation, because the flow is consumed here.
pub async fn handle_tcp_flow(
    flow: InterceptedFlow<TcpStream>,
    ctx: &ProxyContext,
) -> Result<BridgeReport, TproxyError> {
    info!("tcp: {} -> {}", flow.source, flow.original_dst);

    let dest = TargetAddr::from(flow.original_dst);
    let session = ctx.client.connect_tcp(&dest).await?;
    debug!("tcp: {} bound at {}", dest, session.bound_addr);

    let report = bridge_tcp(flow.handle, session.into_stream(), ctx.tcp_idle).await;
    info!("tcp: {} -> {} closed, {}", flow.source, flow.original_dst, report);

    Ok(report)
}
