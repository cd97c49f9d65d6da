//! SOCKS5 command requests and replies
//!
//! Encodes CONNECT / UDP ASSOCIATE requests and decodes the server reply.

use super::consts::*;
use super::types::{SocksCommand, TargetAddr};
use crate::error::Socks5Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A successful SOCKS5 reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// BND.ADDR / BND.PORT
    pub bound_addr: TargetAddr,
}

/// Encode a command request
///
/// # SOCKS5 Request Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn build_request(command: SocksCommand, dest: &TargetAddr) -> Result<Vec<u8>, Socks5Error> {
    let mut request = Vec::with_capacity(3 + dest.serialized_len());
    request.push(SOCKS5_VERSION);
    request.push(command.to_byte());
    request.push(SOCKS5_RESERVED);
    dest.write_to(&mut request)?;
    Ok(request)
}

/// Send a command request and read the reply
///
/// Transport failures surface as [`Socks5Error::Io`], a non-zero reply as
/// [`Socks5Error::Command`].
pub async fn send_command<S>(
    stream: &mut S,
    command: SocksCommand,
    dest: &TargetAddr,
) -> Result<Reply, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_request(command, dest)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    read_reply(stream).await
}

/// Read a reply from the server
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// REP is checked before the address: a failure reply is reported as
/// [`Socks5Error::Command`] whatever follows it.
pub async fn read_reply<S>(stream: &mut S) -> Result<Reply, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(header[0]));
    }
    if header[1] != SOCKS5_REPLY_SUCCEEDED {
        return Err(Socks5Error::Command { code: header[1] });
    }
    let atyp = header[3];

    // Read exactly the address so no relayed payload is consumed.
    let mut addr_buf = vec![atyp];
    match atyp {
        SOCKS5_ADDR_TYPE_IPV4 => read_more(stream, &mut addr_buf, 4 + 2).await?,
        SOCKS5_ADDR_TYPE_IPV6 => read_more(stream, &mut addr_buf, 16 + 2).await?,
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            addr_buf.push(len as u8);
            read_more(stream, &mut addr_buf, len + 2).await?;
        }
        other => return Err(Socks5Error::AddressTypeNotSupported(other)),
    }

    let (bound_addr, _) = TargetAddr::read_from(&addr_buf)?;
    Ok(Reply { bound_addr })
}

async fn read_more<S>(stream: &mut S, buf: &mut Vec<u8>, n: usize) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let start = buf.len();
    buf.resize(start + n, 0);
    stream.read_exact(&mut buf[start..]).await?;
    Ok(())
}
