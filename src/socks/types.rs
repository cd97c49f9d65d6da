//! SOCKS5 type definitions
//!
//! Defines the core types used in SOCKS5 protocol handling.

use super::consts::*;
use crate::error::Socks5Error;
use bytes::{Buf, BufMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// TCP CONNECT - establish a TCP connection to target
    Connect,
    /// UDP ASSOCIATE - establish UDP relay
    UdpAssociate,
}

impl SocksCommand {
    /// Convert SocksCommand to byte
    pub fn to_byte(self) -> u8 {
        match self {
            SocksCommand::Connect => SOCKS5_CMD_TCP_CONNECT,
            SocksCommand::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::Connect => write!(f, "CONNECT"),
            SocksCommand::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// Authentication method negotiated with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required
    NoAuth,
    /// Username/password authentication
    UserPass,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::NoAuth => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::UserPass => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }

    /// Parse from SOCKS5 method byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_AUTH_METHOD_NONE => Some(AuthMethod::NoAuth),
            SOCKS5_AUTH_METHOD_PASSWORD => Some(AuthMethod::UserPass),
            _ => None,
        }
    }
}

/// Target address for SOCKS5 requests
///
/// Represents the destination address in a SOCKS5 request or relay header.
/// Can be an IP address (v4 or v6) or a domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// Create a new TargetAddr from an IPv4 address and port
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Create a new TargetAddr from an IPv6 address and port
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port))
    }

    /// Create a new TargetAddr from a domain name and port
    pub fn domain(domain: String, port: u16) -> Self {
        TargetAddr::Domain(domain, port)
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Get the address type byte for SOCKS5 protocol
    pub fn addr_type(&self) -> u8 {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => SOCKS5_ADDR_TYPE_IPV4,
            TargetAddr::Ip(SocketAddr::V6(_)) => SOCKS5_ADDR_TYPE_IPV6,
            TargetAddr::Domain(_, _) => SOCKS5_ADDR_TYPE_DOMAIN,
        }
    }

    /// Number of bytes [`TargetAddr::write_to`] produces
    pub fn serialized_len(&self) -> usize {
        match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            TargetAddr::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            TargetAddr::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Write `ATYP | ADDR | PORT` to `buf`
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<(), Socks5Error> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            TargetAddr::Domain(domain, port) => {
                if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
                    return Err(Socks5Error::InvalidDomain(domain.clone()));
                }
                buf.put_u8(SOCKS5_ADDR_TYPE_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Parse `ATYP | ADDR | PORT` from the front of `buf`
    ///
    /// Returns the address and the number of bytes consumed. A buffer that
    /// ends before the address does yields an `UnexpectedEof` IO error.
    pub fn read_from(buf: &[u8]) -> Result<(Self, usize), Socks5Error> {
        let mut cursor = buf;
        if cursor.is_empty() {
            return Err(short_buffer("address type"));
        }

        let atyp = cursor.get_u8();
        let addr = match atyp {
            SOCKS5_ADDR_TYPE_IPV4 => {
                if cursor.len() < 4 + 2 {
                    return Err(short_buffer("IPv4 address"));
                }
                let mut octets = [0u8; 4];
                cursor.copy_to_slice(&mut octets);
                TargetAddr::ipv4(Ipv4Addr::from(octets), cursor.get_u16())
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                if cursor.len() < 16 + 2 {
                    return Err(short_buffer("IPv6 address"));
                }
                let mut octets = [0u8; 16];
                cursor.copy_to_slice(&mut octets);
                TargetAddr::ipv6(Ipv6Addr::from(octets), cursor.get_u16())
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                if cursor.is_empty() {
                    return Err(short_buffer("domain length"));
                }
                let len = cursor.get_u8() as usize;
                if cursor.len() < len + 2 {
                    return Err(short_buffer("domain name"));
                }
                let domain = String::from_utf8(cursor[..len].to_vec())
                    .map_err(|_| Socks5Error::InvalidDomain("non UTF-8 domain".to_string()))?;
                cursor.advance(len);
                TargetAddr::domain(domain, cursor.get_u16())
            }
            other => return Err(Socks5Error::AddressTypeNotSupported(other)),
        };

        Ok((addr, buf.len() - cursor.len()))
    }

    /// Serialize the address to bytes for SOCKS5 protocol
    pub fn to_bytes(&self) -> Result<Vec<u8>, Socks5Error> {
        let mut bytes = Vec::with_capacity(self.serialized_len());
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    /// Resolve the address to a SocketAddr
    ///
    /// For IP addresses, this returns immediately.
    /// For domain names, this performs DNS resolution.
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("No addresses found for domain: {}", domain),
                    )
                }),
        }
    }
}

fn short_buffer(what: &str) -> Socks5Error {
    Socks5Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("buffer too short for {}", what),
    ))
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl Default for TargetAddr {
    fn default() -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}
