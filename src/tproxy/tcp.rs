//! Transparent TCP listener

use super::sockopt::set_transparent;
use super::{unmap, InterceptedFlow, Protocol};
use crate::error::TproxyError;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

/// Listen backlog for intercepting sockets
const LISTEN_BACKLOG: i32 = 1024;

/// Create a transparent TCP listener on `bind`
///
/// Any failure is reported as [`TproxyError::Listen`] for this address.
pub fn listen_tcp(bind: SocketAddr) -> Result<TcpListener, TproxyError> {
    let listen_err = |source| TproxyError::Listen { addr: bind, source };

    let socket = Socket::new(
        Domain::for_address(bind),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(listen_err)?;

    if bind.is_ipv6() {
        socket.set_only_v6(false).map_err(listen_err)?;
    }
    set_transparent(&socket, bind.is_ipv6()).map_err(listen_err)?;
    socket.set_reuse_address(true).map_err(listen_err)?;
    socket.set_nonblocking(true).map_err(listen_err)?;
    socket.bind(&bind.into()).map_err(listen_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(listen_err)?;

    let listener = TcpListener::from_std(socket.into()).map_err(listen_err)?;
    info!("tcp listening on {}", bind);
    Ok(listener)
}

/// Accept one intercepted connection
///
/// With `IP_TRANSPARENT` set, the local address of the accepted socket is
/// the destination the client originally dialed.
pub async fn accept_tcp(listener: &TcpListener) -> Result<InterceptedFlow<TcpStream>, TproxyError> {
    let (stream, source) = listener.accept().await.map_err(TproxyError::Accept)?;
    let original_dst = stream
        .local_addr()
        .map_err(|e| TproxyError::Resolution(e.to_string()))?;

    Ok(InterceptedFlow {
        protocol: Protocol::Tcp,
        source: unmap(source),
        original_dst: unmap(original_dst),
        handle: stream,
    })
}
