//! Intercepted UDP flows
//!
//! A flow is the pair (client source, original destination). The first
//! datagram of a flow creates a transparent reply socket and a SOCKS5 UDP
//! association; later datagrams of the same flow that still land on the
//! listener are handed to that flow instead of opening another association.

use super::{ProxyContext, ACCEPT_ERROR_DELAY};
use crate::error::TproxyError;
use crate::relay::{bridge_udp, BridgeReport, DatagramChannel};
use crate::socks::{TargetAddr, MAX_UDP_PACKET};
use crate::tproxy::{bind_and_connect_udp, read_datagram, unmap, InterceptedFlow, Protocol};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Datagrams queued per flow before new ones are dropped
const FLOW_BACKLOG: usize = 256;

/// (client source, original destination)
pub type FlowKey = (SocketAddr, SocketAddr);

/// Live UDP flows of one listener
///
/// Owned by the listener's read loop alone. Entries whose bridge has ended
/// are pruned whenever a new flow is inserted.
#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<FlowKey, mpsc::Sender<Bytes>>,
}

impl FlowTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked flows, live or not yet pruned
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Check if no flows are tracked
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Hand `datagram` to the live flow for `key`
    ///
    /// Returns the datagram back when there is no live flow, in which case
    /// the caller should start one.
    pub fn dispatch(&mut self, key: &FlowKey, datagram: Bytes) -> Option<Bytes> {
        let Some(sender) = self.flows.get(key) else {
            return Some(datagram);
        };
        match sender.try_send(datagram) {
            Ok(()) => None,
            Err(TrySendError::Full(_)) => {
                warn!("udp: {} -> {} backlog full, dropping datagram", key.0, key.1);
                None
            }
            Err(TrySendError::Closed(datagram)) => {
                self.flows.remove(key);
                Some(datagram)
            }
        }
    }

    /// Track a new flow, pruning finished ones
    pub fn insert(&mut self, key: FlowKey, sender: mpsc::Sender<Bytes>) {
        self.flows.retain(|_, tx| !tx.is_closed());
        self.flows.insert(key, sender);
    }

    /// Deliver `datagram` to its flow, registering the flow if it has none
    ///
    /// Returns the backlog of a newly registered flow, already holding
    /// `datagram`; the caller must start serving it.
    pub fn route(&mut self, key: FlowKey, datagram: Bytes) -> Option<mpsc::Receiver<Bytes>> {
        let first = self.dispatch(&key, datagram)?;

        let (tx, rx) = mpsc::channel(FLOW_BACKLOG);
        // Capacity is at least one, so the first datagram always fits.
        let _ = tx.try_send(first);
        self.insert(key, tx);
        Some(rx)
    }
}

/// Read loop for one transparent UDP socket
pub(crate) async fn run_udp_listener(socket: UdpSocket, ctx: Arc<ProxyContext>) {
    route_datagrams(&socket, |source, original_dst, backlog| {
        let ctx = ctx.clone();
        async move { handle_udp_flow(source, original_dst, backlog, &ctx).await }
    })
    .await
}

/// Read datagrams off `socket` and start a flow with `start` for every new
/// (source, original destination) pair
///
/// Flow tasks belong to this loop and are aborted when it is dropped.
async fn route_datagrams<F, Fut>(socket: &UdpSocket, start: F)
where
    F: Fn(SocketAddr, SocketAddr, mpsc::Receiver<Bytes>) -> Fut,
    Fut: Future<Output = Result<BridgeReport, TproxyError>> + Send + 'static,
{
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    let mut flows = FlowTable::new();
    let mut tasks = JoinSet::new();

    loop {
        let received = tokio::select! {
            received = read_datagram(socket, &mut buf) => received,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
        };

        let (n, source, original_dst) = match received {
            Ok(received) => received,
            Err(e @ TproxyError::Read(_)) => {
                warn!("{}", e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                continue;
            }
            Err(e) => {
                warn!("udp: dropping datagram: {}", e);
                continue;
            }
        };

        let (source, original_dst) = (unmap(source), unmap(original_dst));
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        let Some(backlog) = flows.route((source, original_dst), datagram) else {
            continue;
        };

        let flow = start(source, original_dst, backlog);
        tasks.spawn(async move {
            if let Err(e) = flow.await {
                if e.is_timeout() {
                    debug!("udp: {} -> {} timed out: {}", source, original_dst, e);
                } else {
                    warn!("udp: {} -> {} failed: {}", source, original_dst, e);
                }
            }
        });
    }
}

/// Serve one UDP flow from a fresh transparent reply socket
///
/// Fails with [`TproxyError::Socket`] before any upstream negotiation when
/// the reply socket cannot be built.
pub async fn handle_udp_flow(
    source: SocketAddr,
    original_dst: SocketAddr,
    backlog: mpsc::Receiver<Bytes>,
    ctx: &ProxyContext,
) -> Result<BridgeReport, TproxyError> {
    let reply = bind_and_connect_udp(original_dst, source)?;
    let flow = InterceptedFlow {
        protocol: Protocol::Udp,
        source,
        original_dst,
        handle: reply,
    };
    serve_udp_flow(flow, backlog, ctx).await
}

/// Associate with the SOCKS5 server and bridge `flow` until it goes idle
/// or the association ends
pub async fn serve_udp_flow<C>(
    flow: InterceptedFlow<C>,
    backlog: mpsc::Receiver<Bytes>,
    ctx: &ProxyContext,
) -> Result<BridgeReport, TproxyError>
where
    C: DatagramChannel,
{
    info!("udp: {} -> {}", flow.source, flow.original_dst);

    let dest = TargetAddr::from(flow.original_dst);
    let session = ctx.client.connect_udp(&dest).await?;
    debug!("udp: {} relayed via {}", dest, session.relay_addr);

    let (endpoint, control) = session.into_parts();
    let report = bridge_udp(
        flow.handle,
        backlog,
        endpoint,
        ctx.udp_idle,
        association_closed(control),
    )
    .await;
    info!("udp: {} -> {} closed, {}", flow.source, flow.original_dst, report);

    Ok(report)
}

/// Completes when the server closes the UDP ASSOCIATE control connection
async fn association_closed(mut control: TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match control.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
