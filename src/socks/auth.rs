//! SOCKS5 client authentication
//!
//! Method negotiation (RFC 1928 §3) and username/password sub-negotiation
//! (RFC 1929) from the client side.

use super::consts::*;
use super::types::AuthMethod;
use crate::config::SocksServerConfig;
use crate::error::Socks5Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Build the method selection message offered to the server
///
/// No-auth is always offered first; username/password is offered only when
/// credentials are configured.
pub fn method_selection_request(config: &SocksServerConfig) -> Vec<u8> {
    if config.has_credentials() {
        vec![
            SOCKS5_VERSION,
            2,
            SOCKS5_AUTH_METHOD_NONE,
            SOCKS5_AUTH_METHOD_PASSWORD,
        ]
    } else {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }
}

/// Negotiate an authentication method and authenticate if required
///
/// # Protocol
///
/// ```text
/// client -> | VER | NMETHODS | METHODS  |
/// server -> | VER | METHOD |
/// ```
///
/// When the server selects username/password, the RFC 1929 exchange follows.
pub async fn negotiate<S>(stream: &mut S, config: &SocksServerConfig) -> Result<AuthMethod, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&method_selection_request(config)).await?;
    stream.flush().await?;

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }

    let method = match AuthMethod::from_byte(buf[1]) {
        Some(AuthMethod::UserPass) if !config.has_credentials() => {
            return Err(Socks5Error::Auth(
                "server selected username/password but no credentials are configured".to_string(),
            ));
        }
        Some(method) => method,
        None if buf[1] == SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => {
            return Err(Socks5Error::Auth("no acceptable authentication method".to_string()));
        }
        None => {
            return Err(Socks5Error::Auth(format!(
                "server selected unoffered method {:#04x}",
                buf[1]
            )));
        }
    };

    if method == AuthMethod::UserPass {
        let username = config.username.as_deref().unwrap_or_default();
        let password = config.password.as_deref().unwrap_or_default();
        authenticate_password(stream, username, password).await?;
    }

    debug!("SOCKS5 method negotiated: {:?}", method);
    Ok(method)
}

/// Perform the RFC 1929 username/password exchange
///
/// ```text
/// client -> | VER | ULEN | UNAME | PLEN | PASSWD |
/// server -> | VER | STATUS |
/// ```
pub async fn authenticate_password<S>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.is_empty() || username.len() > 255 || password.len() > 255 {
        return Err(Socks5Error::Auth("credential length out of range".to_string()));
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(SOCKS5_AUTH_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());

    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;

    if reply[1] != SOCKS5_AUTH_SUCCESS {
        return Err(Socks5Error::Auth(format!(
            "credentials rejected for user {} (status {:#04x})",
            username, reply[1]
        )));
    }

    Ok(())
}
