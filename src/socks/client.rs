//! SOCKS5 client
//!
//! Dials the configured upstream, negotiates authentication and issues
//! CONNECT or UDP ASSOCIATE on behalf of an intercepted flow.

use super::auth::negotiate;
use super::command::send_command;
use super::consts::*;
use super::types::{AuthMethod, SocksCommand, TargetAddr};
use super::udp::EncapsulatedUdp;
use crate::config::SocksServerConfig;
use crate::error::{Socks5Error, Socks5ReplyCode};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

/// An established upstream session
///
/// Owned by exactly one flow and dropped with it.
#[derive(Debug)]
pub struct UpstreamSession {
    /// Connection to the SOCKS5 server
    pub stream: TcpStream,
    /// Negotiated authentication method
    pub method: AuthMethod,
    /// Command the server accepted
    pub command: SocksCommand,
    /// BND.ADDR / BND.PORT from the reply
    pub bound_addr: TargetAddr,
}

impl UpstreamSession {
    /// Take the duplex connection for relaying
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// An established UDP association
#[derive(Debug)]
pub struct UdpRelaySession {
    /// Control connection that keeps the association alive
    pub control: UpstreamSession,
    /// Relay endpoint reported by the server
    pub relay_addr: SocketAddr,
    /// Socket connected to the relay endpoint
    pub endpoint: EncapsulatedUdp,
}

impl UdpRelaySession {
    /// Split into the datagram endpoint and the control connection
    pub fn into_parts(self) -> (EncapsulatedUdp, TcpStream) {
        (self.endpoint, self.control.stream)
    }
}

/// SOCKS5 client bound to one upstream server
///
/// Cloning is cheap; the configuration is shared read-only.
#[derive(Debug, Clone)]
pub struct Socks5Client {
    config: Arc<SocksServerConfig>,
}

impl Socks5Client {
    /// Create a new client for the given server configuration
    pub fn new(config: SocksServerConfig) -> Self {
        Socks5Client {
            config: Arc::new(config),
        }
    }

    /// Get a reference to the server configuration
    pub fn config(&self) -> &SocksServerConfig {
        &self.config
    }

    /// Open a TCP connection to `dest` through the server
    ///
    /// Any reply other than success fails with [`Socks5Error::Command`].
    pub async fn connect_tcp(&self, dest: &TargetAddr) -> Result<UpstreamSession, Socks5Error> {
        let session = self.establish(SocksCommand::Connect, dest).await?;
        debug!("SOCKS5 CONNECT to {} established", dest);
        Ok(session)
    }

    /// Open a UDP association for `dest` through the server
    ///
    /// A "command not supported" reply fails with
    /// [`Socks5Error::UnsupportedCommand`]; no UDP socket is created unless
    /// the server accepted the association.
    pub async fn connect_udp(&self, dest: &TargetAddr) -> Result<UdpRelaySession, Socks5Error> {
        let control = match self.establish(SocksCommand::UdpAssociate, dest).await {
            Err(Socks5Error::Command {
                code: SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            }) => return Err(Socks5Error::UnsupportedCommand),
            other => other?,
        };

        let server_ip = control.stream.peer_addr()?.ip();
        let relay_addr = relay_endpoint(&control.bound_addr, server_ip).await?;

        let local: SocketAddr = match relay_addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(relay_addr).await?;

        debug!("SOCKS5 UDP ASSOCIATE for {} relayed via {}", dest, relay_addr);

        Ok(UdpRelaySession {
            control,
            relay_addr,
            endpoint: EncapsulatedUdp::new(socket, dest.clone()),
        })
    }

    /// Dial, negotiate and issue `command`, bounded by the connect timeout
    async fn establish(
        &self,
        command: SocksCommand,
        dest: &TargetAddr,
    ) -> Result<UpstreamSession, Socks5Error> {
        let timeout = self.config.connect_timeout();
        tokio::time::timeout(timeout, self.handshake(command, dest))
            .await
            .map_err(|_| {
                Socks5Error::Timeout(format!(
                    "SOCKS5 {} to {} via {} exceeded {:?}",
                    command, dest, self.config.server, timeout
                ))
            })?
    }

    async fn handshake(
        &self,
        command: SocksCommand,
        dest: &TargetAddr,
    ) -> Result<UpstreamSession, Socks5Error> {
        let mut stream = TcpStream::connect(self.config.server.as_str()).await?;
        stream.set_nodelay(true)?;
        trace!("SOCKS5 connected to {}", self.config.server);

        let method = negotiate(&mut stream, &self.config).await?;
        trace!("SOCKS5 {} to {}: authenticated with {:?}", command, dest, method);

        let reply = match send_command(&mut stream, command, dest).await {
            Err(Socks5Error::Command { code }) => {
                match Socks5ReplyCode::try_from(code) {
                    Ok(reason) => debug!("SOCKS5 {} to {} rejected: {:?}", command, dest, reason),
                    Err(_) => debug!(
                        "SOCKS5 {} to {} rejected with unknown code {:#04x}",
                        command, dest, code
                    ),
                }
                return Err(Socks5Error::Command { code });
            }
            other => other?,
        };

        Ok(UpstreamSession {
            stream,
            method,
            command,
            bound_addr: reply.bound_addr,
        })
    }
}

/// Work out where encapsulated datagrams must be sent
///
/// An unspecified BND.ADDR means "same host as the server".
async fn relay_endpoint(bound: &TargetAddr, server_ip: IpAddr) -> Result<SocketAddr, Socks5Error> {
    match bound {
        TargetAddr::Ip(addr) if addr.ip().is_unspecified() => {
            Ok(SocketAddr::new(server_ip, addr.port()))
        }
        TargetAddr::Ip(addr) => Ok(*addr),
        TargetAddr::Domain(..) => Ok(bound.resolve().await?),
    }
}
