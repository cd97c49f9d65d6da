//! Test utilities and mocks for tproxy2socks
//!
//! This module provides a scriptable SOCKS5 server, echo targets and a
//! configuration builder shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tproxy2socks::socks::*;

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Create a pair of UDP sockets connected to each other
pub async fn create_udp_pair() -> (UdpSocket, UdpSocket) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.connect(b.local_addr().unwrap()).await.unwrap();
    b.connect(a.local_addr().unwrap()).await.unwrap();
    (a, b)
}

/// Spawn a TCP server that echoes everything back
pub async fn spawn_tcp_echo() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Test configuration builder
pub struct TestConfigBuilder {
    bind: Vec<String>,
    server: String,
    credentials: Option<(String, String)>,
    tcp_idle_timeout: u64,
    udp_idle_timeout: u64,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            bind: vec!["127.0.0.1:12345".to_string()],
            server: "127.0.0.1:1080".to_string(),
            credentials: None,
            tcp_idle_timeout: 0,
            udp_idle_timeout: 10,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SOCKS5 server address
    pub fn server(mut self, addr: SocketAddr) -> Self {
        self.server = addr.to_string();
        self
    }

    /// Set SOCKS5 credentials
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Set TCP idle timeout
    pub fn tcp_idle_timeout(mut self, secs: u64) -> Self {
        self.tcp_idle_timeout = secs;
        self
    }

    /// Set UDP idle timeout
    pub fn udp_idle_timeout(mut self, secs: u64) -> Self {
        self.udp_idle_timeout = secs;
        self
    }

    /// Build the configuration
    pub fn build(self) -> tproxy2socks::config::Config {
        let mut socks = tproxy2socks::config::SocksServerConfig::new(self.server);
        if let Some((username, password)) = self.credentials {
            socks = socks.with_credentials(username, password);
        }
        tproxy2socks::config::Config {
            proxy: tproxy2socks::config::ProxyConfig {
                bind: self.bind,
                tcp_idle_timeout: self.tcp_idle_timeout,
                udp_idle_timeout: self.udp_idle_timeout,
            },
            socks,
        }
    }
}

/// Behaviour of a [`MockSocksServer`]
#[derive(Clone, Default)]
pub struct MockOptions {
    /// Required username/password; `None` accepts no-auth
    pub credentials: Option<(String, String)>,
    /// Reply code for every command (0 = success)
    pub reply_code: u8,
    /// Where CONNECT sessions are really connected to
    pub connect_to: Option<SocketAddr>,
    /// Send one malformed relay datagram before each echo
    pub garbage_before_echo: bool,
    /// Close the UDP ASSOCIATE control connection after this many echoes
    pub close_association_after: Option<usize>,
}

/// A SOCKS5 server that records requests
///
/// CONNECT sessions are spliced to `connect_to`; UDP associations get a
/// relay that echoes every payload back to the sender with the same header.
pub struct MockSocksServer {
    /// Listening address
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<(u8, TargetAddr)>>>,
}

impl MockSocksServer {
    /// Start the server
    pub async fn start(options: MockOptions) -> Self {
        let (listener, addr) = create_test_listener().await;
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let options = options.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, options, recorded).await;
                });
            }
        });

        MockSocksServer { addr, requests }
    }

    /// Commands and destinations received so far
    pub fn requests(&self) -> Vec<(u8, TargetAddr)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(
    mut stream: TcpStream,
    options: MockOptions,
    recorded: Arc<Mutex<Vec<(u8, TargetAddr)>>>,
) -> std::io::Result<()> {
    // Method selection
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    match &options.credentials {
        Some((username, password)) => {
            if !methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD) {
                stream
                    .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
                    .await?;
                return Ok(());
            }
            stream
                .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_PASSWORD])
                .await?;

            let mut ver_ulen = [0u8; 2];
            stream.read_exact(&mut ver_ulen).await?;
            let mut user = vec![0u8; ver_ulen[1] as usize];
            stream.read_exact(&mut user).await?;
            let plen = stream.read_u8().await? as usize;
            let mut pass = vec![0u8; plen];
            stream.read_exact(&mut pass).await?;

            if user != username.as_bytes() || pass != password.as_bytes() {
                stream.write_all(&[SOCKS5_AUTH_VERSION, 0x01]).await?;
                return Ok(());
            }
            stream
                .write_all(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_SUCCESS])
                .await?;
        }
        None => {
            stream
                .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
                .await?;
        }
    }

    // Request
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let mut addr = vec![header[3]];
    match header[3] {
        SOCKS5_ADDR_TYPE_IPV4 => addr.resize(1 + 6, 0),
        SOCKS5_ADDR_TYPE_IPV6 => addr.resize(1 + 18, 0),
        _ => {
            let len = stream.read_u8().await?;
            addr.push(len);
            addr.resize(2 + len as usize + 2, 0);
        }
    }
    let start = if header[3] == SOCKS5_ADDR_TYPE_DOMAIN { 2 } else { 1 };
    stream.read_exact(&mut addr[start..]).await?;
    let (dest, _) = TargetAddr::read_from(&addr).unwrap();
    recorded.lock().unwrap().push((header[1], dest));

    if options.reply_code != SOCKS5_REPLY_SUCCEEDED {
        stream
            .write_all(&[SOCKS5_VERSION, options.reply_code, 0, 1, 0, 0, 0, 0, 0, 0])
            .await?;
        return Ok(());
    }

    match header[1] {
        SOCKS5_CMD_TCP_CONNECT => {
            let target = options.connect_to.expect("connect_to not configured");
            let mut upstream = TcpStream::connect(target).await?;
            let bound = upstream.local_addr()?;
            let mut reply = vec![SOCKS5_VERSION, SOCKS5_REPLY_SUCCEEDED, SOCKS5_RESERVED];
            reply.extend(TargetAddr::from(bound).to_bytes().unwrap());
            stream.write_all(&reply).await?;
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        }
        SOCKS5_CMD_UDP_ASSOCIATE => {
            let relay = UdpSocket::bind("127.0.0.1:0").await?;
            let port = relay.local_addr()?.port();

            // Unspecified BND.ADDR: the client must use the server's IP.
            let mut reply = vec![SOCKS5_VERSION, SOCKS5_REPLY_SUCCEEDED, 0, 1, 0, 0, 0, 0];
            reply.extend_from_slice(&port.to_be_bytes());
            stream.write_all(&reply).await?;

            let echoes = echo_relay(relay, options.garbage_before_echo, options.close_association_after);
            let mut control_buf = [0u8; 16];
            tokio::select! {
                _ = echoes => {}
                _ = stream.read(&mut control_buf) => {}
            }
        }
        _ => {
            stream
                .write_all(&[SOCKS5_VERSION, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED, 0, 1, 0, 0, 0, 0, 0, 0])
                .await?;
        }
    }

    Ok(())
}

async fn echo_relay(relay: UdpSocket, garbage_first: bool, limit: Option<usize>) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    let mut echoed = 0;
    loop {
        let Ok((n, from)) = relay.recv_from(&mut buf).await else {
            return;
        };
        let Ok((dest, payload)) = decapsulate(&buf[..n]) else {
            continue;
        };
        if garbage_first {
            let _ = relay.send_to(&[0, 0, 0], from).await;
        }
        let Ok(datagram) = encapsulate(&dest, payload) else {
            continue;
        };
        let _ = relay.send_to(&datagram, from).await;

        echoed += 1;
        if limit.is_some_and(|limit| echoed >= limit) {
            return;
        }
    }
}
