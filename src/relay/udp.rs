//! Datagram bridge for intercepted UDP flows

use super::{watch_idle, BridgeReport, DatagramChannel, DirectionEnd, DirectionReport, IdleTimer};
use crate::error::TproxyError;
use crate::socks::MAX_UDP_PACKET;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Relay datagrams between an intercepted UDP flow and its relay session
///
/// Client datagrams arrive either on `inbound` itself or through `backlog`,
/// where the listener hands over datagrams of this flow that reached the
/// intercepting socket. Each one is forwarded as exactly one `outbound`
/// send; replies travel back the same way. Malformed relay datagrams are
/// dropped and the bridge keeps going.
///
/// Both directions share one idle deadline, refreshed by every datagram
/// either way. The bridge also ends when `guard` completes, which callers use to tie
/// the flow to its UDP ASSOCIATE control connection.
///
/// # Arguments
///
/// * `inbound` - Transparent socket connected to the original client
/// * `backlog` - Datagrams dispatched by the intercepting listener
/// * `outbound` - Encapsulating endpoint towards the SOCKS5 relay
/// * `idle` - Idle deadline for the whole bridge, `None` to disable
/// * `guard` - Completes when the association is gone
pub async fn bridge_udp<C, U, G>(
    inbound: C,
    mut backlog: mpsc::Receiver<Bytes>,
    outbound: U,
    idle: Option<Duration>,
    guard: G,
) -> BridgeReport
where
    C: DatagramChannel,
    U: DatagramChannel,
    G: Future<Output = ()> + Send,
{
    let token = CancellationToken::new();
    let timer = IdleTimer::new(idle);

    let to_upstream = async {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        let mut backlog_open = true;
        let mut bytes = 0u64;
        let mut datagrams = 0u64;

        let end = loop {
            let received = tokio::select! {
                _ = token.cancelled() => break timer.cancelled_end(),
                result = next_from_client(&inbound, &mut backlog, &mut backlog_open, &mut buf) => result,
            };
            let n = match received {
                Ok(n) => n,
                Err(e) => {
                    debug!("udp outbound read error: {}", e);
                    break DirectionEnd::Error;
                }
            };
            timer.touch();

            if let Some(end) = forward(&outbound, &buf[..n], &timer, &token, "outbound").await {
                break end;
            }
            bytes += n as u64;
            datagrams += 1;
        };

        token.cancel();
        DirectionReport::new(bytes, datagrams, end)
    };

    let to_client = async {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        let mut bytes = 0u64;
        let mut datagrams = 0u64;

        let end = loop {
            let received = tokio::select! {
                _ = token.cancelled() => break timer.cancelled_end(),
                result = outbound.recv_datagram(&mut buf) => result,
            };
            let n = match received {
                Ok(n) => n,
                Err(TproxyError::MalformedDatagram(reason)) => {
                    timer.touch();
                    warn!("Dropping relay datagram: {}", reason);
                    continue;
                }
                Err(e) => {
                    debug!("udp inbound read error: {}", e);
                    break DirectionEnd::Error;
                }
            };
            timer.touch();

            if let Some(end) = forward(&inbound, &buf[..n], &timer, &token, "inbound").await {
                break end;
            }
            bytes += n as u64;
            datagrams += 1;
        };

        token.cancel();
        DirectionReport::new(bytes, datagrams, end)
    };

    let association = async {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = guard => {
                debug!("udp association closed by upstream");
                token.cancel();
            }
        }
    };

    let (outbound_report, inbound_report, (), ()) = tokio::join!(
        to_upstream,
        to_client,
        association,
        watch_idle(&timer, &token, "udp"),
    );

    BridgeReport {
        outbound: outbound_report,
        inbound: inbound_report,
    }
}

/// Next client datagram, from the backlog or straight off the socket
async fn next_from_client<C: DatagramChannel>(
    inbound: &C,
    backlog: &mut mpsc::Receiver<Bytes>,
    backlog_open: &mut bool,
    buf: &mut [u8],
) -> Result<usize, TproxyError> {
    loop {
        if !*backlog_open {
            return inbound.recv_datagram(buf).await;
        }

        let queued = tokio::select! {
            queued = backlog.recv() => queued,
            result = inbound.recv_datagram(buf) => return result,
        };

        match queued {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                return Ok(n);
            }
            None => *backlog_open = false,
        }
    }
}

/// Send one datagram; returns how the direction ends if it must stop
async fn forward<D: DatagramChannel>(
    channel: &D,
    payload: &[u8],
    timer: &IdleTimer,
    token: &CancellationToken,
    label: &str,
) -> Option<DirectionEnd> {
    tokio::select! {
        _ = token.cancelled() => Some(timer.cancelled_end()),
        result = channel.send_datagram(payload) => match result {
            Ok(()) => {
                timer.touch();
                None
            }
            Err(e) => {
                debug!("udp {} send error: {}", label, e);
                Some(DirectionEnd::Error)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::{decapsulate, encapsulate, EncapsulatedUdp, TargetAddr};
    use std::net::Ipv4Addr;
    use tokio::net::UdpSocket;
    use tokio::sync::oneshot;

    struct Harness {
        client: UdpSocket,
        relay: UdpSocket,
        dest: TargetAddr,
        backlog: mpsc::Sender<Bytes>,
        close: oneshot::Sender<()>,
        bridge: tokio::task::JoinHandle<BridgeReport>,
    }

    async fn connected_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (a, b)
    }

    async fn start(idle: Option<Duration>) -> Harness {
        let (client, client_side) = connected_pair().await;
        let (relay, upstream_side) = connected_pair().await;
        let dest = TargetAddr::ipv4(Ipv4Addr::new(1, 1, 1, 1), 53);
        let (backlog, backlog_rx) = mpsc::channel(16);
        let (close, close_rx) = oneshot::channel::<()>();

        let endpoint = EncapsulatedUdp::new(upstream_side, dest.clone());
        let guard = async move {
            let _ = close_rx.await;
        };
        let bridge = tokio::spawn(bridge_udp(client_side, backlog_rx, endpoint, idle, guard));

        Harness {
            client,
            relay,
            dest,
            backlog,
            close,
            bridge,
        }
    }

    #[tokio::test]
    async fn test_bridge_udp_preserves_datagrams() {
        let h = start(None).await;
        let mut buf = [0u8; 256];

        h.client.send(b"a").await.unwrap();
        h.client.send(b"bb").await.unwrap();

        let n = h.relay.recv(&mut buf).await.unwrap();
        assert_eq!(decapsulate(&buf[..n]).unwrap(), (h.dest.clone(), &b"a"[..]));
        let n = h.relay.recv(&mut buf).await.unwrap();
        assert_eq!(decapsulate(&buf[..n]).unwrap(), (h.dest.clone(), &b"bb"[..]));

        h.relay.send(&encapsulate(&h.dest, b"ccc").unwrap()).await.unwrap();
        let n = h.client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ccc");

        drop(h.close);
        let report = h.bridge.await.unwrap();
        assert_eq!(report.outbound.datagrams, 2);
        assert_eq!(report.outbound.bytes, 3);
        assert_eq!(report.inbound.datagrams, 1);
    }

    #[tokio::test]
    async fn test_bridge_udp_forwards_backlog() {
        let h = start(None).await;
        let mut buf = [0u8; 256];

        h.backlog.send(Bytes::from_static(b"queued")).await.unwrap();
        let n = h.relay.recv(&mut buf).await.unwrap();
        assert_eq!(decapsulate(&buf[..n]).unwrap().1, b"queued");

        // Closing the backlog leaves the socket path working.
        drop(h.backlog);
        h.client.send(b"direct").await.unwrap();
        let n = h.relay.recv(&mut buf).await.unwrap();
        assert_eq!(decapsulate(&buf[..n]).unwrap().1, b"direct");

        drop(h.close);
        h.bridge.await.unwrap();
    }

    #[tokio::test]
    async fn test_bridge_udp_drops_malformed() {
        let h = start(None).await;
        let mut buf = [0u8; 256];

        h.relay.send(&[0, 0, 0]).await.unwrap();
        h.relay.send(&encapsulate(&h.dest, b"valid").unwrap()).await.unwrap();

        let n = h.client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"valid");
        assert!(!h.bridge.is_finished());

        drop(h.close);
        let report = h.bridge.await.unwrap();
        assert_eq!(report.inbound.datagrams, 1);
    }

    #[tokio::test]
    async fn test_bridge_udp_idle_timeout() {
        let h = start(Some(Duration::from_millis(100))).await;

        let report = tokio::time::timeout(Duration::from_secs(2), h.bridge)
            .await
            .expect("bridge did not time out")
            .unwrap();
        assert!(report.timed_out());
    }

    #[tokio::test]
    async fn test_bridge_udp_receive_only_stream_stays_up() {
        let h = start(Some(Duration::from_millis(200))).await;
        let mut buf = [0u8; 256];

        // The client stays silent while the relay keeps sending.
        let relay = h.relay;
        let dest = h.dest.clone();
        let sender = tokio::spawn(async move {
            for i in 0..20u8 {
                relay.send(&encapsulate(&dest, &[i]).unwrap()).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            relay
        });

        for i in 0..20u8 {
            let n = h.client.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[i]);
        }
        assert!(!h.bridge.is_finished());

        let _relay = sender.await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(2), h.bridge)
            .await
            .expect("bridge did not time out")
            .unwrap();
        assert!(report.timed_out());
        assert_eq!(report.inbound.datagrams, 20);
    }

    #[tokio::test]
    async fn test_bridge_udp_ends_with_association() {
        let h = start(None).await;
        h.close.send(()).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(1), h.bridge)
            .await
            .expect("bridge did not stop")
            .unwrap();
        assert_eq!(report.outbound.end, DirectionEnd::Cancelled);
        assert_eq!(report.inbound.end, DirectionEnd::Cancelled);
    }
}
