//! Transparent reply sockets

use super::sockopt::set_transparent;
use crate::error::TproxyError;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Create a UDP socket bound to `local` and connected to `remote`
///
/// `local` is normally the flow's original destination, which the host
/// does not own; replies sent on this socket reach the client as if they
/// came from that destination. Any failure is a [`TproxyError::Socket`]
/// and the half-built socket is closed before returning.
pub fn bind_and_connect_udp(local: SocketAddr, remote: SocketAddr) -> Result<UdpSocket, TproxyError> {
    if local.is_ipv4() != remote.is_ipv4() {
        return Err(TproxyError::Socket(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address family mismatch: {} -> {}", local, remote),
        )));
    }

    let socket = Socket::new(
        Domain::for_address(local),
        Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(TproxyError::Socket)?;

    set_transparent(&socket, local.is_ipv6()).map_err(TproxyError::Socket)?;
    socket.set_reuse_address(true).map_err(TproxyError::Socket)?;
    socket.bind(&local.into()).map_err(TproxyError::Socket)?;
    socket.connect(&remote.into()).map_err(TproxyError::Socket)?;
    socket.set_nonblocking(true).map_err(TproxyError::Socket)?;

    UdpSocket::from_std(socket.into()).map_err(TproxyError::Socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_family_mismatch() {
        let result = bind_and_connect_udp(
            "127.0.0.1:0".parse().unwrap(),
            "[::1]:53".parse().unwrap(),
        );
        assert!(matches!(result, Err(TproxyError::Socket(_))));
    }

    #[tokio::test]
    async fn test_bind_and_connect_loopback() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        match bind_and_connect_udp("127.0.0.1:0".parse().unwrap(), client_addr) {
            Ok(socket) => {
                assert_eq!(socket.peer_addr().unwrap(), client_addr);
                socket.send(b"reply").await.unwrap();

                let mut buf = [0u8; 16];
                let (n, from) = client.recv_from(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"reply");
                assert_eq!(from, socket.local_addr().unwrap());
            }
            // Unprivileged runs cannot set IP_TRANSPARENT.
            Err(TproxyError::Socket(e)) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
