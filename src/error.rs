//! Error types for tproxy2socks
//!
//! This module defines the error taxonomy used by the transparent proxy core.
//! Every error is scoped to a single flow except [`TproxyError::Listen`],
//! which is fatal for one bind address only.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for tproxy2socks operations
#[derive(Error, Debug)]
pub enum TproxyError {
    /// A listener could not be created on a bind address
    #[error("Listen error on {addr}: {source}")]
    Listen {
        /// Bind address that failed
        addr: SocketAddr,
        /// Underlying OS error
        source: io::Error,
    },

    /// Accepting a connection on an intercepting listener failed
    #[error("Accept error: {0}")]
    Accept(io::Error),

    /// Reading a datagram on an intercepting socket failed
    #[error("Read error: {0}")]
    Read(io::Error),

    /// The original destination could not be recovered
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// Building a transparent socket failed
    #[error("Socket error: {0}")]
    Socket(io::Error),

    /// SOCKS5 negotiation with the upstream failed
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// A relay datagram could not be decapsulated
    #[error("Malformed datagram: {0}")]
    MalformedDatagram(String),

    /// A bridge saw no traffic for its idle deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// SOCKS5 client-side errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Method negotiation failed or credentials were rejected
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The server answered a command with a non-success reply
    #[error("Command failed with reply code {code:#04x}")]
    Command {
        /// Raw REP field of the reply
        code: u8,
    },

    /// The server does not support the requested command
    #[error("Command not supported by SOCKS5 server")]
    UnsupportedCommand,

    /// Transport failure while talking to the server
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The server answered with a version other than 5
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// The server answered with an unknown address type
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// A domain name could not be encoded or decoded
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// Dialing or negotiating took longer than the connect timeout
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            code => Err(Socks5Error::Command { code }),
        }
    }
}

impl TproxyError {
    /// Whether this error came from an expired idle deadline
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TproxyError::Timeout(_) | TproxyError::Socks5(Socks5Error::Timeout(_))
        )
    }
}
