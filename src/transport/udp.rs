//! UDP leg of an upstream exchange.
//!
//! One ephemeral socket per exchange, connected to the upstream so the
//! kernel discards datagrams from anyone else.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::dns;
use crate::error::UpstreamError;

use super::{MAX_UDP_PAYLOAD, UpstreamResult};

/// Send `query` and wait up to `timeout` for a single reply datagram.
///
/// Replies that are empty, carry the TC bit, or exceed the classic 512-byte
/// payload are returned as errors so the caller can escalate to TCP.
pub async fn exchange(upstream: SocketAddr, query: &[u8], timeout: Duration) -> UpstreamResult {
    let bind_addr: SocketAddr = if upstream.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(upstream).await?;

    // One spare byte to detect datagrams larger than the classic limit.
    let mut buf = [0u8; MAX_UDP_PAYLOAD + 1];
    let len = tokio::time::timeout(timeout, send_and_receive(&socket, query, &mut buf))
        .await
        .map_err(|_| UpstreamError::Timeout(timeout))??;

    debug!(upstream = %upstream, bytes = len, "UDP response received");

    if len == 0 {
        return Err(UpstreamError::Malformed("empty UDP response"));
    }
    if len > MAX_UDP_PAYLOAD {
        return Err(UpstreamError::Truncated);
    }

    let response = &buf[..len];
    if dns::is_truncated(response) {
        return Err(UpstreamError::Truncated);
    }

    Ok(response.to_vec())
}

async fn send_and_receive(
    socket: &UdpSocket,
    query: &[u8],
    buf: &mut [u8],
) -> std::io::Result<usize> {
    socket.send(query).await?;
    socket.recv(buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::{TYPE_A, build_query, build_response};

    async fn one_shot_upstream(reply: Vec<u8>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((_, src)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&reply, src).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn returns_reply_verbatim() {
        let query = build_query(0x1234, "example.com", TYPE_A);
        let response = build_response(&query, [93, 184, 216, 34]);
        let upstream = one_shot_upstream(response.clone()).await;

        let got = exchange(upstream, &query, Duration::from_secs(1)).await.unwrap();

        assert_eq!(got, response);
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(1, "example.com", TYPE_A);

        let err = exchange(silent.local_addr().unwrap(), &query, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, UpstreamError::Timeout(_)));
    }

    #[tokio::test]
    async fn closed_port_is_a_socket_error() {
        let closed = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);
        let query = build_query(1, "example.com", TYPE_A);

        let err = exchange(addr, &query, Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Io(_)), "got {err:?}");
        assert!(err.is_reset());
    }

    #[tokio::test]
    async fn truncated_reply_is_an_error() {
        let query = build_query(1, "example.com", TYPE_A);
        let mut response = build_response(&query, [1, 2, 3, 4]);
        response[2] |= 0x02;
        let upstream = one_shot_upstream(response).await;

        let err = exchange(upstream, &query, Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Truncated));
    }

    #[tokio::test]
    async fn oversized_reply_is_an_error() {
        let query = build_query(1, "example.com", TYPE_A);
        let mut response = build_response(&query, [1, 2, 3, 4]);
        response.resize(MAX_UDP_PAYLOAD + 100, 0);
        let upstream = one_shot_upstream(response).await;

        let err = exchange(upstream, &query, Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Truncated));
    }

    #[tokio::test]
    async fn empty_reply_is_malformed() {
        let query = build_query(1, "example.com", TYPE_A);
        let upstream = one_shot_upstream(Vec::new()).await;

        let err = exchange(upstream, &query, Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Malformed(_)));
    }
}
