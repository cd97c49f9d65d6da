//! Transparent UDP listener

use super::cmsg::{decode_sockaddr, find_original_dst, parse_control_messages};
use super::sockopt::{set_recv_orig_dst, set_transparent};
use crate::error::TproxyError;
use socket2::{Domain, Socket, Type};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Room for the original-destination message plus anything else the
/// kernel attaches
const CONTROL_BUFFER_LEN: usize = 256;

/// Create a transparent UDP socket on `bind` that reports each datagram's
/// original destination
pub fn listen_udp(bind: SocketAddr) -> Result<UdpSocket, TproxyError> {
    let listen_err = |source| TproxyError::Listen { addr: bind, source };
    let ipv6 = bind.is_ipv6();

    let socket = Socket::new(
        Domain::for_address(bind),
        Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(listen_err)?;

    if ipv6 {
        socket.set_only_v6(false).map_err(listen_err)?;
    }
    set_transparent(&socket, ipv6).map_err(listen_err)?;
    set_recv_orig_dst(&socket, ipv6).map_err(listen_err)?;
    socket.set_reuse_address(true).map_err(listen_err)?;
    socket.set_nonblocking(true).map_err(listen_err)?;
    socket.bind(&bind.into()).map_err(listen_err)?;

    let socket = UdpSocket::from_std(socket.into()).map_err(listen_err)?;
    info!("udp listening on {}", bind);
    Ok(socket)
}

/// Receive one datagram with its source and original destination
///
/// Truncated datagrams are logged and skipped. Fails with
/// [`TproxyError::Resolution`] when the kernel attached no original
/// destination, and with [`TproxyError::Read`] on socket errors.
pub async fn read_datagram(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> Result<(usize, SocketAddr, SocketAddr), TproxyError> {
    let mut control = [0u8; CONTROL_BUFFER_LEN];

    loop {
        let raw = socket
            .async_io(Interest::READABLE, || {
                recv_with_control(socket.as_raw_fd(), &mut *buf, &mut control)
            })
            .await
            .map_err(TproxyError::Read)?;

        if raw.flags & libc::MSG_TRUNC != 0 {
            warn!("Dropping truncated datagram ({} byte buffer)", buf.len());
            continue;
        }
        if raw.flags & libc::MSG_CTRUNC != 0 {
            warn!("Control data truncated");
        }

        let source = decode_sockaddr(&raw.name[..raw.name_len])?;
        let messages = parse_control_messages(&control[..raw.control_len])?;
        let original_dst = find_original_dst(&messages)?;

        return Ok((raw.len, source, original_dst));
    }
}

struct RawDatagram {
    len: usize,
    name: [u8; mem::size_of::<libc::sockaddr_storage>()],
    name_len: usize,
    control_len: usize,
    flags: libc::c_int,
}

fn recv_with_control(fd: RawFd, buf: &mut [u8], control: &mut [u8]) -> io::Result<RawDatagram> {
    let mut name = [0u8; mem::size_of::<libc::sockaddr_storage>()];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // SAFETY: msghdr is plain data; zeroed is a valid starting value.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = name.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = name.len() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len() as _;

    // SAFETY: every pointer in `msg` refers to a live buffer of the stated
    // length for the duration of the call.
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(RawDatagram {
        len: n as usize,
        name,
        name_len: (msg.msg_namelen as usize).min(name.len()),
        control_len: (msg.msg_controllen as usize).min(control.len()),
        flags: msg.msg_flags,
    })
}
