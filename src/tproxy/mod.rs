//! Transparent interception
//!
//! Listeners that receive traffic redirected by TPROXY rules and recover
//! each flow's original destination, plus the factory for sockets that
//! answer clients as that destination.
//!
//! # Linux requirements
//!
//! The intercepting sockets need `IP_TRANSPARENT`, which in turn needs
//! `CAP_NET_ADMIN`. Traffic must be steered with something like:
//!
//! ```text
//! ip rule add fwmark 1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! iptables -t mangle -A PREROUTING -p tcp -j TPROXY --on-port 12345 --tproxy-mark 1
//! iptables -t mangle -A PREROUTING -p udp -j TPROXY --on-port 12345 --tproxy-mark 1
//! ```

pub mod cmsg;
pub mod sockopt;
mod tcp;
mod transparent;
mod udp;

pub use tcp::{accept_tcp, listen_tcp};
pub use transparent::bind_and_connect_udp;
pub use udp::{listen_udp, read_datagram};

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Transport of an intercepted flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Stream flow
    Tcp,
    /// Datagram flow
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A flow captured by a transparent listener
///
/// `handle` is owned exclusively by the flow; dropping the flow closes it.
#[derive(Debug)]
pub struct InterceptedFlow<H> {
    /// Transport
    pub protocol: Protocol,
    /// Address of the intercepted client
    pub source: SocketAddr,
    /// Destination the client originally addressed
    pub original_dst: SocketAddr,
    /// OS-level connection or socket
    pub handle: H,
}

impl<H> fmt::Display for InterceptedFlow<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.protocol, self.source, self.original_dst)
    }
}

/// Convert an IPv4-mapped IPv6 address to plain IPv4
///
/// Dual-stack listeners report IPv4 peers as `::ffff:a.b.c.d`.
pub fn unmap(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}
