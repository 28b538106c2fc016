//! Error types for the proxy.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// A query that cannot be interpreted well enough to build a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("message too short ({0} bytes)")]
    TooShort(usize),

    #[error("message is a response, not a query")]
    NotAQuery,

    #[error("message carries no question")]
    NoQuestion,

    #[error("question section is truncated")]
    Truncated,

    /// Compression pointers and the reserved 0x40/0x80 label types are not
    /// valid in the first question of a query.
    #[error("unsupported label type 0x{0:02x}")]
    BadLabel(u8),

    #[error("name exceeds 255 bytes")]
    NameTooLong,
}

/// Failure of an upstream exchange.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// No response arrived before the per-attempt timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// Socket level failure, including resets by the upstream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A response arrived but cannot be used as-is.
    #[error("malformed response: {0}")]
    Malformed(&'static str),

    /// The UDP response had the TC bit set or did not fit a classic datagram.
    #[error("response truncated")]
    Truncated,

    /// Both the UDP attempt and the TCP fallback failed.
    #[error("upstream unavailable (udp: {udp}; tcp: {tcp})")]
    Unavailable {
        udp: Box<UpstreamError>,
        tcp: Box<UpstreamError>,
    },
}

impl UpstreamError {
    /// Whether the failure was the peer tearing the connection down.
    pub fn is_reset(&self) -> bool {
        match self {
            UpstreamError::Io(e) => is_transport_reset(e),
            UpstreamError::Unavailable { udp, tcp } => udp.is_reset() || tcp.is_reset(),
            _ => false,
        }
    }
}

/// Invalid proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cache TTL must be greater than zero")]
    ZeroTtl,

    #[error("worker pool size must be greater than zero")]
    ZeroWorkers,

    #[error("upstream timeout must be greater than zero")]
    ZeroTimeout,
}

/// Errors that stop the proxy from starting.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for proxy setup.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Returns true for errors caused by the remote end closing or resetting the
/// connection.
pub fn is_transport_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
