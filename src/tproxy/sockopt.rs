//! Raw socket options for transparent proxying

use socket2::Socket;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;

/// `IP_RECVORIGDSTADDR` (linux/in.h); also the cmsg type of the reply
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// `IPV6_RECVORIGDSTADDR` (linux/in6.h); also the cmsg type of the reply
pub const IPV6_RECVORIGDSTADDR: libc::c_int = 74;

fn setsockopt_int<S: AsRawFd>(
    socket: &S,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: the fd is valid for the lifetime of `socket` and the option
    // value is a plain int of the advertised length.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Allow binding to and accepting for addresses the host does not own
///
/// Requires `CAP_NET_ADMIN`. socket2 only covers the IPv4 option.
pub fn set_transparent(socket: &Socket, ipv6: bool) -> io::Result<()> {
    if ipv6 {
        setsockopt_int(socket, libc::SOL_IPV6, libc::IPV6_TRANSPARENT, 1)
    } else {
        socket.set_ip_transparent(true)
    }
}

/// Ask the kernel to attach the original destination to each datagram
///
/// IPv6 sockets get both options so IPv4 traffic on a dual-stack socket is
/// covered too.
pub fn set_recv_orig_dst<S: AsRawFd>(socket: &S, ipv6: bool) -> io::Result<()> {
    setsockopt_int(socket, libc::SOL_IP, IP_RECVORIGDSTADDR, 1)?;
    if ipv6 {
        setsockopt_int(socket, libc::SOL_IPV6, IPV6_RECVORIGDSTADDR, 1)?;
    }
    Ok(())
}
