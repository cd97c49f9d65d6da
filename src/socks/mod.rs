//! SOCKS5 client module for tproxy2socks
//!
//! This module implements the client side of SOCKS5 (RFC 1928) and the
//! username/password sub-negotiation (RFC 1929). Every intercepted flow
//! gets its own upstream session; nothing is pooled or shared.

mod auth;
mod client;
mod command;
mod consts;
mod types;
mod udp;

pub use auth::{authenticate_password, method_selection_request, negotiate};
pub use client::{Socks5Client, UdpRelaySession, UpstreamSession};
pub use command::{build_request, read_reply, send_command, Reply};
pub use consts::*;
pub use types::{AuthMethod, SocksCommand, TargetAddr};
pub use udp::{decapsulate, encapsulate, EncapsulatedUdp};
