//! TCP leg of an upstream exchange.
//!
//! DNS messages over TCP are prefixed with a 2-byte big-endian length. A
//! fresh connection is opened per exchange and closed afterwards.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::UpstreamError;

use super::UpstreamResult;

/// Connect, send the framed query and read one framed reply, all within
/// `timeout`.
pub async fn exchange(upstream: SocketAddr, query: &[u8], timeout: Duration) -> UpstreamResult {
    let response = tokio::time::timeout(timeout, connect_and_exchange(upstream, query))
        .await
        .map_err(|_| UpstreamError::Timeout(timeout))??;

    debug!(upstream = %upstream, bytes = response.len(), "TCP response received");

    Ok(response)
}

async fn connect_and_exchange(upstream: SocketAddr, query: &[u8]) -> UpstreamResult {
    let mut stream = TcpStream::connect(upstream).await?;
    stream.set_nodelay(true)?;

    write_dns_message(&mut stream, query).await?;
    read_dns_message(&mut stream).await
}

/// Write `message` with its length prefix.
pub async fn write_dns_message<W>(stream: &mut W, message: &[u8]) -> Result<(), UpstreamError>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(message.len())
        .map_err(|_| UpstreamError::Malformed("message exceeds 65535 bytes"))?;

    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);

    stream.write_all(&framed).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed message and return it without the prefix.
pub async fn read_dns_message<R>(stream: &mut R) -> UpstreamResult
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await?;

    let len = u16::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(UpstreamError::Malformed("empty TCP response"));
    }

    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;
    Ok(message)
}
