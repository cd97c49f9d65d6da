//! SOCKS5 UDP relay encapsulation
//!
//! Wraps and unwraps payloads in the UDP relay header and provides the
//! datagram endpoint that talks to the server's relay.

use super::consts::*;
use super::types::TargetAddr;
use crate::error::TproxyError;
use crate::relay::DatagramChannel;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Prefix `payload` with a relay header addressed to `dest`
///
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
///
/// The fragment field is always zero.
pub fn encapsulate(dest: &TargetAddr, payload: &[u8]) -> Result<Bytes, TproxyError> {
    let mut buf = BytesMut::with_capacity(3 + dest.serialized_len() + payload.len());

    // RSV (2 bytes)
    buf.put_u16(0);
    // FRAG (1 byte)
    buf.put_u8(0);
    // ATYP | DST.ADDR | DST.PORT
    dest.write_to(&mut buf)?;
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Split a relay datagram into its address and payload
///
/// The payload is returned as the exact trailing bytes of `datagram`.
/// Datagrams shorter than the header, with a non-zero reserved field, or
/// with a non-zero fragment number are rejected.
pub fn decapsulate(datagram: &[u8]) -> Result<(TargetAddr, &[u8]), TproxyError> {
    if datagram.len() < UDP_HEADER_MIN_LEN {
        return Err(malformed(format!(
            "datagram too short: {} bytes",
            datagram.len()
        )));
    }

    let rsv = u16::from_be_bytes([datagram[0], datagram[1]]);
    if rsv != 0 {
        return Err(malformed(format!("invalid RSV field: {}", rsv)));
    }

    let frag = datagram[2];
    if frag != 0 {
        return Err(malformed(format!("fragmented datagram (FRAG={})", frag)));
    }

    let (addr, used) =
        TargetAddr::read_from(&datagram[3..]).map_err(|e| malformed(e.to_string()))?;

    Ok((addr, &datagram[3 + used..]))
}

fn malformed(reason: String) -> TproxyError {
    TproxyError::MalformedDatagram(reason)
}

/// Datagram endpoint connected to the server's UDP relay
///
/// Every send is wrapped in one relay header addressed to the flow's
/// destination; every receive is unwrapped back to the bare payload.
#[derive(Debug)]
pub struct EncapsulatedUdp {
    socket: UdpSocket,
    destination: TargetAddr,
}

impl EncapsulatedUdp {
    /// Wrap a socket already connected to the relay endpoint
    pub fn new(socket: UdpSocket, destination: TargetAddr) -> Self {
        EncapsulatedUdp {
            socket,
            destination,
        }
    }

    /// Destination written into every outgoing header
    pub fn destination(&self) -> &TargetAddr {
        &self.destination
    }

    /// Relay endpoint this socket is connected to
    pub fn relay_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

#[async_trait]
impl DatagramChannel for EncapsulatedUdp {
    async fn recv_datagram(&self, buf: &mut [u8]) -> Result<usize, TproxyError> {
        let n = self.socket.recv(buf).await?;
        let payload_len = decapsulate(&buf[..n])?.1.len();
        buf.copy_within(n - payload_len..n, 0);
        Ok(payload_len)
    }

    async fn send_datagram(&self, payload: &[u8]) -> Result<(), TproxyError> {
        let datagram = encapsulate(&self.destination, payload)?;
        self.socket.send(&datagram).await?;
        Ok(())
    }
}
