//! Bridge engine
//!
//! Joins an intercepted flow to its upstream session. Both directions run
//! concurrently and share one termination signal; whichever direction ends
//! first cancels the other, and the bridge returns only after both have
//! stopped and both handles have been released.
//!
//! ```text
//! intercepted flow <--- inbound ---  bridge  --- outbound ---> SOCKS5 upstream
//! ```

mod tcp;
mod udp;

pub use tcp::bridge_tcp;
pub use udp::bridge_udp;

use crate::error::TproxyError;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Idle deadline shared by both directions of a bridge
///
/// Every successful read or write on either side pushes the deadline back,
/// so a one-way transfer keeps the whole bridge alive.
#[derive(Debug)]
pub(crate) struct IdleTimer {
    idle: Option<Duration>,
    last_activity: Mutex<Instant>,
    fired: AtomicBool,
}

impl IdleTimer {
    pub(crate) fn new(idle: Option<Duration>) -> Self {
        IdleTimer {
            idle,
            last_activity: Mutex::new(Instant::now()),
            fired: AtomicBool::new(false),
        }
    }

    /// Record traffic
    pub(crate) fn touch(&self) {
        if self.idle.is_some() {
            *self.lock() = Instant::now();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Completes once neither direction has seen traffic for the idle period
    ///
    /// Never completes when no deadline is configured.
    pub(crate) async fn expired(&self) -> TproxyError {
        let Some(idle) = self.idle else {
            return std::future::pending().await;
        };

        loop {
            let deadline = *self.lock() + idle;
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep_until(deadline).await;
        }

        self.fired.store(true, Ordering::SeqCst);
        TproxyError::Timeout(format!("no traffic for {:?}", idle))
    }

    /// How a direction ended once the bridge was cancelled
    pub(crate) fn cancelled_end(&self) -> DirectionEnd {
        if self.fired.load(Ordering::SeqCst) {
            DirectionEnd::Timeout
        } else {
            DirectionEnd::Cancelled
        }
    }
}

/// Cancel the bridge when `timer` expires; returns early once it is cancelled
pub(crate) async fn watch_idle(timer: &IdleTimer, token: &CancellationToken, label: &str) {
    tokio::select! {
        _ = token.cancelled() => {}
        e = timer.expired() => {
            debug!("{} bridge: {}", label, e);
            token.cancel();
        }
    }
}

/// A message-oriented endpoint
///
/// Every call moves exactly one datagram; implementations never merge or
/// split payloads.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Receive one datagram payload into `buf`, returning its length
    async fn recv_datagram(&self, buf: &mut [u8]) -> Result<usize, TproxyError>;

    /// Send `payload` as one datagram
    async fn send_datagram(&self, payload: &[u8]) -> Result<(), TproxyError>;
}

#[async_trait]
impl DatagramChannel for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> Result<usize, TproxyError> {
        Ok(self.recv(buf).await?)
    }

    async fn send_datagram(&self, payload: &[u8]) -> Result<(), TproxyError> {
        self.send(payload).await?;
        Ok(())
    }
}

/// How one direction of a bridge stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    /// The source reached end-of-stream
    Eof,
    /// Neither direction saw traffic within the idle deadline
    Timeout,
    /// A read or write failed
    Error,
    /// The other direction or the association ended first
    Cancelled,
}

impl fmt::Display for DirectionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DirectionEnd::Eof => "eof",
            DirectionEnd::Timeout => "timeout",
            DirectionEnd::Error => "error",
            DirectionEnd::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Outcome of one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionReport {
    /// Bytes (or payload bytes for UDP) forwarded
    pub bytes: u64,
    /// Datagrams forwarded; always zero for TCP
    pub datagrams: u64,
    /// Why the direction stopped
    pub end: DirectionEnd,
}

impl DirectionReport {
    pub(crate) fn new(bytes: u64, datagrams: u64, end: DirectionEnd) -> Self {
        DirectionReport {
            bytes,
            datagrams,
            end,
        }
    }
}

/// Outcome of a whole bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeReport {
    /// Intercepted flow to upstream
    pub outbound: DirectionReport,
    /// Upstream to intercepted flow
    pub inbound: DirectionReport,
}

impl BridgeReport {
    /// Whether the bridge was torn down by its idle deadline
    pub fn timed_out(&self) -> bool {
        self.outbound.end == DirectionEnd::Timeout || self.inbound.end == DirectionEnd::Timeout
    }
}

impl fmt::Display for BridgeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "out {} bytes ({}), in {} bytes ({})",
            self.outbound.bytes, self.outbound.end, self.inbound.bytes, self.inbound.end
        )
    }
}
