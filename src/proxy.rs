//! DNS proxy service.
//!
//! Binds the listener, runs the acceptor loop and the stats reporter, and
//! shuts both down on request.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::DnsCache;
use crate::dispatcher::{BacklogPolicy, DEFAULT_WORKERS, Dispatcher};
use crate::error::{ConfigError, ProxyError, Result, is_transport_reset};
use crate::handler::RequestHandler;
use crate::stats::Stats;
use crate::transport::{DEFAULT_TIMEOUT, Upstream, UpstreamClient};

/// Largest inbound datagram accepted. Queries are normally well under the
/// classic 512 bytes, but EDNS clients may send more. Anything larger is
/// dropped rather than forwarded cut short.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to listen on
    pub listen_addr: SocketAddr,
    /// Upstream resolver, used for both UDP and TCP
    pub upstream_addr: SocketAddr,
    /// How long a cached response stays fresh
    pub cache_ttl: Duration,
    /// Entry ceiling, 0 for unbounded
    pub cache_max_entries: usize,
    /// Maximum requests handled concurrently
    pub workers: usize,
    /// What to do when all workers are busy
    pub backlog: BacklogPolicy,
    /// Per-attempt upstream timeout, applied to UDP and TCP separately
    pub timeout: Duration,
    /// How often to log statistics, `None` to disable
    pub stats_interval: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 53)),
            upstream_addr: SocketAddr::from(([1, 1, 1, 1], 53)),
            cache_ttl: Duration::from_secs(60),
            cache_max_entries: 10_000,
            workers: DEFAULT_WORKERS,
            backlog: BacklogPolicy::Block,
            timeout: DEFAULT_TIMEOUT,
            stats_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::ZeroTtl);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// A bound, not yet running proxy.
pub struct Proxy {
    config: ProxyConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    cache: Arc<DnsCache>,
    upstream: Arc<dyn Upstream>,
    stats: Arc<Stats>,
}

impl Proxy {
    /// Validate `config` and bind the listener. Failing to bind is the only
    /// fatal error the proxy has.
    pub async fn bind(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = socket.local_addr()?;

        let stats = Arc::new(Stats::new());
        let cache = Arc::new(
            DnsCache::new(config.cache_ttl).with_max_entries(config.cache_max_entries),
        );
        let upstream = Arc::new(
            UpstreamClient::new(config.upstream_addr, config.timeout).with_stats(stats.clone()),
        );

        Ok(Self {
            config,
            socket: Arc::new(socket),
            local_addr,
            cache,
            upstream,
            stats,
        })
    }

    /// Replace the upstream client, e.g. with a test double.
    pub fn with_upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the acceptor loop (and the stats reporter if configured).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> ProxyHandle {
        let shutdown = CancellationToken::new();

        info!(
            listen = %self.local_addr,
            upstream = %self.config.upstream_addr,
            ttl_secs = self.config.cache_ttl.as_secs_f64(),
            workers = self.config.workers,
            backlog = ?self.config.backlog,
            "DNS proxy listening"
        );

        let handler = Arc::new(RequestHandler::new(
            self.cache.clone(),
            self.upstream,
            self.stats.clone(),
        ));
        let dispatcher = Dispatcher::new(
            handler,
            self.socket.clone(),
            self.config.workers,
            self.config.backlog,
            self.stats.clone(),
        );

        let acceptor = tokio::spawn(run_acceptor(
            self.socket,
            dispatcher,
            self.stats.clone(),
            shutdown.clone(),
        ));
        let reporter = self.config.stats_interval.map(|interval| {
            tokio::spawn(report_stats(
                self.stats.clone(),
                self.cache.clone(),
                interval,
                shutdown.clone(),
            ))
        });

        ProxyHandle {
            local_addr: self.local_addr,
            cache: self.cache,
            stats: self.stats,
            shutdown,
            acceptor,
            reporter,
        }
    }
}

/// Control handle for a running proxy.
pub struct ProxyHandle {
    local_addr: SocketAddr,
    cache: Arc<DnsCache>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
    acceptor: JoinHandle<()>,
    reporter: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Stop accepting datagrams, wait for in-flight requests to finish and
    /// close the listener.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        if let Err(e) = self.acceptor.await {
            error!("acceptor task failed: {e}");
        }
        if let Some(reporter) = self.reporter {
            let _ = reporter.await;
        }

        info!(listen = %self.local_addr, "DNS proxy stopped");
    }
}

/// Read datagrams one at a time and hand them to the dispatcher until
/// cancelled, then drain the workers.
async fn run_acceptor(
    socket: Arc<UdpSocket>,
    mut dispatcher: Dispatcher,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
) {
    // One spare byte to tell an oversized datagram from one that fits.
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

    loop {
        let (len, client) = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) if is_transport_reset(&e) => {
                    // ICMP port unreachable from an earlier reply surfaces
                    // here on some platforms.
                    debug!("listener reset by peer: {e}");
                    continue;
                }
                Err(e) => {
                    warn!("listener receive error: {e}");
                    continue;
                }
            },
        };

        if len > MAX_DATAGRAM_SIZE {
            debug!(client = %client, limit = MAX_DATAGRAM_SIZE, "dropping oversized datagram");
            stats.record_malformed();
            continue;
        }

        dispatcher.submit(buf[..len].to_vec(), client).await;
    }

    info!(in_flight = dispatcher.busy(), "shutting down, draining in-flight requests");
    dispatcher.drain().await;
}

async fn report_stats(
    stats: Arc<Stats>,
    cache: Arc<DnsCache>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let snap = stats.snapshot_and_reset();
        info!(
            cache = cache.len(),
            requests = snap.requests,
            cached = snap.cached,
            forwarded = snap.forwarded,
            unresolved = snap.unresolved,
            malformed = snap.malformed,
            rejected = snap.rejected,
            tcp_fallbacks = snap.tcp_attempts,
            upstream_resets = snap.upstream_resets,
            avg_response_ms = snap.avg_response_ms,
            "stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::{TYPE_A, build_query, build_response};
    use crate::handler::tests::MockUpstream;

    fn local_config() -> ProxyConfig {
        ProxyConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_addr: "127.0.0.1:9".parse().unwrap(),
            stats_interval: None,
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = ProxyConfig::default();

        assert_eq!(config.listen_addr, "0.0.0.0:53".parse().unwrap());
        assert_eq!(config.upstream_addr, "1.1.1.1:53".parse().unwrap());
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.workers, 10);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.backlog, BacklogPolicy::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_values() {
        let zero_ttl = ProxyConfig {
            cache_ttl: Duration::ZERO,
            ..local_config()
        };
        let zero_workers = ProxyConfig {
            workers: 0,
            ..local_config()
        };
        let zero_timeout = ProxyConfig {
            timeout: Duration::ZERO,
            ..local_config()
        };

        assert_eq!(zero_ttl.validate(), Err(ConfigError::ZeroTtl));
        assert_eq!(zero_workers.validate(), Err(ConfigError::ZeroWorkers));
        assert_eq!(zero_timeout.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ProxyConfig {
            listen_addr: taken.local_addr().unwrap(),
            ..local_config()
        };

        let err = Proxy::bind(config).await.err().unwrap();

        assert!(matches!(err, ProxyError::Bind { .. }));
    }

    #[tokio::test]
    async fn serves_queries_and_shuts_down() {
        let upstream = Arc::new(MockUpstream::answering([10, 0, 0, 1]));
        let proxy = Proxy::bind(local_config())
            .await
            .unwrap()
            .with_upstream(upstream.clone());
        let handle = proxy.start();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(0x5151, "example.com", TYPE_A);
        client.send_to(&query, handle.local_addr()).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&buf[..len], &build_response(&query, [10, 0, 0, 1])[..]);
        assert_eq!(upstream.calls(), 1);
        assert_eq!(handle.cache().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_datagram_is_dropped() {
        let upstream = Arc::new(MockUpstream::answering([10, 0, 0, 3]));
        let handle = Proxy::bind(local_config())
            .await
            .unwrap()
            .with_upstream(upstream.clone())
            .start();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut oversized = build_query(1, "example.com", TYPE_A);
        oversized.resize(MAX_DATAGRAM_SIZE + 100, 0);
        client.send_to(&oversized, handle.local_addr()).await.unwrap();

        // A well-formed query sent afterwards proves the first was processed.
        let query = build_query(2, "example.com", TYPE_A);
        client.send_to(&query, handle.local_addr()).await.unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(&buf[..len], &build_response(&query, [10, 0, 0, 3])[..]);
        assert_eq!(upstream.calls(), 1);
        assert_eq!(handle.stats().snapshot().malformed, 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_requests() {
        let upstream = Arc::new(
            MockUpstream::answering([10, 0, 0, 2]).with_delay(Duration::from_millis(200)),
        );
        let handle = Proxy::bind(local_config())
            .await
            .unwrap()
            .with_upstream(upstream.clone())
            .start();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(1, "slow.example.com", TYPE_A);
        client.send_to(&query, handle.local_addr()).await.unwrap();

        // Let the acceptor pick the datagram up before cancelling.
        while upstream.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &build_response(&query, [10, 0, 0, 2])[..]);
    }
}
