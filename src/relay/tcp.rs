//! Stream bridge for intercepted TCP connections

use super::{watch_idle, BridgeReport, DirectionEnd, DirectionReport, IdleTimer};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Copy buffer size per direction
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Relay data bidirectionally between an intercepted connection and its
/// upstream session
///
/// Both directions share one idle deadline when `idle` is set; traffic in
/// either direction refreshes it. The first direction to stop (EOF or I/O
/// error) or an expired deadline cancels everything; both streams are then
/// shut down and dropped before this returns.
///
/// # Arguments
///
/// * `inbound` - The intercepted client connection
/// * `outbound` - The established SOCKS5 CONNECT session
/// * `idle` - Idle deadline for the whole bridge, `None` to disable
pub async fn bridge_tcp<A, B>(inbound: A, outbound: B, idle: Option<Duration>) -> BridgeReport
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let token = CancellationToken::new();
    let timer = IdleTimer::new(idle);

    let (mut a_read, mut a_write) = tokio::io::split(inbound);
    let (mut b_read, mut b_write) = tokio::io::split(outbound);

    let (outbound_report, inbound_report, ()) = tokio::join!(
        copy_direction(&mut a_read, &mut b_write, &timer, &token, "outbound"),
        copy_direction(&mut b_read, &mut a_write, &timer, &token, "inbound"),
        watch_idle(&timer, &token, "tcp"),
    );

    let mut a = a_read.unsplit(a_write);
    let mut b = b_read.unsplit(b_write);
    if let Err(e) = a.shutdown().await {
        debug!("inbound shutdown: {}", e);
    }
    if let Err(e) = b.shutdown().await {
        debug!("outbound shutdown: {}", e);
    }

    BridgeReport {
        outbound: outbound_report,
        inbound: inbound_report,
    }
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    timer: &IdleTimer,
    token: &CancellationToken,
    label: &str,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let end = loop {
        let n = tokio::select! {
            _ = token.cancelled() => break timer.cancelled_end(),
            result = reader.read(&mut buf) => match result {
                Ok(0) => break DirectionEnd::Eof,
                Ok(n) => n,
                Err(e) => {
                    debug!("{} read error: {}", label, e);
                    break DirectionEnd::Error;
                }
            },
        };
        timer.touch();

        tokio::select! {
            _ = token.cancelled() => break timer.cancelled_end(),
            result = writer.write_all(&buf[..n]) => if let Err(e) = result {
                debug!("{} write error: {}", label, e);
                break DirectionEnd::Error;
            },
        }
        timer.touch();

        total += n as u64;
    };

    token.cancel();
    debug!("{} finished: {} bytes, {}", label, total, end);

    DirectionReport::new(total, 0, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bridge_tcp_byte_exact() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);

        let bridge = tokio::spawn(bridge_tcp(client_side, upstream_side, None));

        // Written in uneven chunks, read back in one piece.
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let writer = tokio::spawn(async move {
            for chunk in data.chunks(777) {
                client.write_all(chunk).await.unwrap();
            }
            client
        });

        let mut received = vec![0u8; 5000];
        upstream.read_exact(&mut received).await.unwrap();
        let expected: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(received, expected);

        upstream.write_all(b"reply").await.unwrap();
        let mut client = writer.await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        drop(client);
        let report = bridge.await.unwrap();
        assert_eq!(report.outbound.bytes, 5000);
        assert_eq!(report.inbound.bytes, 5);
        assert_eq!(report.outbound.end, DirectionEnd::Eof);
        assert_eq!(report.inbound.end, DirectionEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_bridge_tcp_eof_closes_both_sides() {
        let (client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);

        let bridge = tokio::spawn(bridge_tcp(client_side, upstream_side, None));
        drop(client);

        let report = tokio::time::timeout(Duration::from_secs(1), bridge)
            .await
            .expect("bridge did not terminate")
            .unwrap();
        assert_eq!(report.outbound.end, DirectionEnd::Eof);

        // Upstream sees its peer closed.
        let mut buf = [0u8; 8];
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bridge_tcp_idle_timeout() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);

        let idle = Some(Duration::from_millis(100));
        let bridge = tokio::spawn(bridge_tcp(client_side, upstream_side, idle));

        let report = tokio::time::timeout(Duration::from_secs(2), bridge)
            .await
            .expect("bridge did not time out")
            .unwrap();
        assert!(report.timed_out());

        // Both handles were released.
        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bridge_tcp_traffic_refreshes_deadline() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);

        let idle = Some(Duration::from_millis(300));
        let bridge = tokio::spawn(bridge_tcp(client_side, upstream_side, idle));

        let mut buf = [0u8; 4];
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.write_all(b"ping").await.unwrap();
            upstream.read_exact(&mut buf).await.unwrap();
            upstream.write_all(b"pong").await.unwrap();
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
        }
        assert!(!bridge.is_finished());

        drop(client);
        let report = bridge.await.unwrap();
        assert_eq!(report.outbound.bytes, 16);
        assert_eq!(report.inbound.bytes, 16);
    }

    #[tokio::test]
    async fn test_bridge_tcp_one_way_download_stays_up() {
        let (mut client, client_side) = duplex(1024);
        let (upstream_side, mut upstream) = duplex(1024);

        let idle = Some(Duration::from_millis(200));
        let bridge = tokio::spawn(bridge_tcp(client_side, upstream_side, idle));

        // The client never writes; only the upstream is talking.
        let server = tokio::spawn(async move {
            for _ in 0..20 {
                upstream.write_all(b"data").await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            upstream
        });

        let mut received = vec![0u8; 80];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, b"data".repeat(20));
        assert!(!bridge.is_finished());

        // Once the upstream goes quiet too, the deadline tears it down.
        let _upstream = server.await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(2), bridge)
            .await
            .expect("bridge did not time out")
            .unwrap();
        assert!(report.timed_out());
        assert_eq!(report.inbound.bytes, 80);
        assert_eq!(report.outbound.end, DirectionEnd::Timeout);
    }

    #[tokio::test]
    async fn test_bridge_tcp_flow_isolation() {
        let mut handles = Vec::new();

        for i in 0..8u8 {
            handles.push(tokio::spawn(async move {
                let (mut client, client_side) = duplex(4096);
                let (upstream_side, mut upstream) = duplex(4096);
                let bridge = tokio::spawn(bridge_tcp(client_side, upstream_side, None));

                let payload = vec![i; 1000];
                client.write_all(&payload).await.unwrap();
                drop(client);

                let mut received = Vec::new();
                upstream.read_to_end(&mut received).await.unwrap();
                bridge.await.unwrap();
                (payload, received)
            }));
        }

        for handle in handles {
            let (sent, received) = handle.await.unwrap();
            assert_eq!(sent, received);
        }
    }
}
