//! Upstream exchange: UDP first, TCP once on failure.
//!
//! UDP is the fast path. It may time out under packet loss or come back
//! truncated, in which case the same query is retried over TCP exactly once.

pub mod tcp;
pub mod udp;

use futures::FutureExt;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::UpstreamError;
use crate::stats::Stats;

/// Classic DNS-over-UDP payload limit.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Per-attempt timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// A response, or why none could be obtained. `Ok` is never empty.
pub type UpstreamResult = Result<Vec<u8>, UpstreamError>;

/// Something that can answer a raw DNS query.
pub trait Upstream: Send + Sync {
    fn resolve<'a>(&'a self, query: &'a [u8]) -> BoxFuture<'a, UpstreamResult>;
}

/// Client for a single fixed upstream resolver.
pub struct UpstreamClient {
    addr: SocketAddr,
    timeout: Duration,
    stats: Arc<Stats>,
}

impl UpstreamClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            stats: Arc::new(Stats::new()),
        }
    }

    /// Record attempts into shared counters instead of private ones.
    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Resolve `query` against the upstream.
    ///
    /// Worst case this takes two timeouts: one for UDP, one for TCP.
    pub async fn exchange(&self, query: &[u8]) -> UpstreamResult {
        self.stats.record_udp_attempt();
        let udp_err = match udp::exchange(self.addr, query, self.timeout).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        debug!(upstream = %self.addr, error = %udp_err, "UDP attempt failed, falling back to TCP");

        self.stats.record_tcp_attempt();
        tcp::exchange(self.addr, query, self.timeout)
            .await
            .map_err(|tcp_err| UpstreamError::Unavailable {
                udp: Box::new(udp_err),
                tcp: Box::new(tcp_err),
            })
    }
}

impl Upstream for UpstreamClient {
    fn resolve<'a>(&'a self, query: &'a [u8]) -> BoxFuture<'a, UpstreamResult> {
        self.exchange(query).boxed()
    }
}
