//! Control message decoding
//!
//! Explicit byte-level decoders for the ancillary data returned by
//! `recvmsg` and for the raw socket addresses it carries.
//!
//! # Byte order
//!
//! ```text
//! cmsghdr       | cmsg_len (usize, native) | level (i32, native) | type (i32, native) | data ... |
//! sockaddr_in   | family (u16, native) | port (u16, big) | addr (4 bytes) | zero (8) |
//! sockaddr_in6  | family (u16, native) | port (u16, big) | flowinfo (u32, big) | addr (16 bytes) | scope_id (u32, native) |
//! ```
//!
//! Address bytes are copied verbatim. Entries in the control buffer are
//! aligned to the width of `usize`.

use super::sockopt::{IPV6_RECVORIGDSTADDR, IP_RECVORIGDSTADDR};
use crate::error::TproxyError;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

const ALIGN: usize = mem::size_of::<usize>();

/// Size of `struct sockaddr_in` up to and including the address
const SOCKADDR_IN_LEN: usize = 8;

/// Size of `struct sockaddr_in6`
const SOCKADDR_IN6_LEN: usize = 28;

const fn cmsg_align(len: usize) -> usize {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

/// Length of a control message header, including padding before the data
pub const CMSG_HDR_LEN: usize = cmsg_align(mem::size_of::<libc::cmsghdr>());

/// One control message borrowed from a control buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage<'a> {
    /// Protocol level (`SOL_IP`, `SOL_IPV6`, ...)
    pub level: i32,
    /// Message type
    pub kind: i32,
    /// Payload
    pub data: &'a [u8],
}

/// Split a control buffer into its messages
pub fn parse_control_messages(buf: &[u8]) -> Result<Vec<ControlMessage<'_>>, TproxyError> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + CMSG_HDR_LEN <= buf.len() {
        let header = &buf[offset..];
        let len = usize::from_ne_bytes(read_array(header, 0)?);
        let level = i32::from_ne_bytes(read_array(header, ALIGN)?);
        let kind = i32::from_ne_bytes(read_array(header, ALIGN + 4)?);

        if len < CMSG_HDR_LEN || offset + len > buf.len() {
            return Err(TproxyError::Resolution(format!(
                "control message length {} out of range at offset {}",
                len, offset
            )));
        }

        messages.push(ControlMessage {
            level,
            kind,
            data: &buf[offset + CMSG_HDR_LEN..offset + len],
        });
        offset += cmsg_align(len);
    }

    Ok(messages)
}

/// Decode a raw `sockaddr_in` / `sockaddr_in6`
pub fn decode_sockaddr(data: &[u8]) -> Result<SocketAddr, TproxyError> {
    let family = u16::from_ne_bytes(read_array(data, 0)?);
    match family as libc::c_int {
        libc::AF_INET => {
            if data.len() < SOCKADDR_IN_LEN {
                return Err(short("sockaddr_in", data.len()));
            }
            let port = u16::from_be_bytes(read_array(data, 2)?);
            let ip = Ipv4Addr::from(read_array::<4>(data, 4)?);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            if data.len() < SOCKADDR_IN6_LEN {
                return Err(short("sockaddr_in6", data.len()));
            }
            let port = u16::from_be_bytes(read_array(data, 2)?);
            let flowinfo = u32::from_be_bytes(read_array(data, 4)?);
            let ip = Ipv6Addr::from(read_array::<16>(data, 8)?);
            let scope_id = u32::from_ne_bytes(read_array(data, 24)?);
            Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, flowinfo, scope_id)))
        }
        other => Err(TproxyError::Resolution(format!(
            "unsupported address family {}",
            other
        ))),
    }
}

/// Find and decode the original destination among `messages`
pub fn find_original_dst(messages: &[ControlMessage<'_>]) -> Result<SocketAddr, TproxyError> {
    messages
        .iter()
        .find(|m| {
            (m.level == libc::SOL_IP && m.kind == IP_RECVORIGDSTADDR)
                || (m.level == libc::SOL_IPV6 && m.kind == IPV6_RECVORIGDSTADDR)
        })
        .ok_or_else(|| {
            TproxyError::Resolution("no original destination in control messages".to_string())
        })
        .and_then(|m| decode_sockaddr(m.data))
}

fn read_array<const N: usize>(buf: &[u8], at: usize) -> Result<[u8; N], TproxyError> {
    buf.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| short("field", buf.len()))
}

fn short(what: &str, len: usize) -> TproxyError {
    TproxyError::Resolution(format!("{} truncated ({} bytes)", what, len))
}
