//! Per-request pipeline.
//!
//! 1. Parse the query and derive its cache key
//! 2. Serve from cache if fresh
//! 3. Otherwise resolve upstream, store, and reply
//!
//! Every failure stays inside the request: malformed queries and unresolved
//! lookups are dropped without a reply, and the client is left to retry.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::cache::DnsCache;
use crate::dns::{self, DnsQuery};
use crate::error::is_transport_reset;
use crate::stats::Stats;
use crate::transport::Upstream;

/// Where replies are written.
pub trait ReplySink: Send + Sync {
    fn send_reply<'a>(&'a self, response: &'a [u8], client: SocketAddr)
    -> BoxFuture<'a, io::Result<()>>;
}

impl ReplySink for UdpSocket {
    fn send_reply<'a>(
        &'a self,
        response: &'a [u8],
        client: SocketAddr,
    ) -> BoxFuture<'a, io::Result<()>> {
        async move { self.send_to(response, client).await.map(|_| ()) }.boxed()
    }
}

/// How a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Answered from cache.
    Cached,
    /// Answered from upstream; the response is now cached.
    Forwarded,
    /// Query could not be parsed; dropped without reply.
    Malformed,
    /// Upstream gave no usable answer; dropped without reply.
    Unresolved,
    /// An answer existed but writing it to the client failed.
    ReplyFailed,
}

/// A query in flight.
struct PendingRequest<'a> {
    raw_query: &'a [u8],
    client: SocketAddr,
    query: DnsQuery,
    received_at: Instant,
}

/// Drives one datagram from receipt to reply.
pub struct RequestHandler {
    cache: Arc<DnsCache>,
    upstream: Arc<dyn Upstream>,
    stats: Arc<Stats>,
}

impl RequestHandler {
    pub fn new(cache: Arc<DnsCache>, upstream: Arc<dyn Upstream>, stats: Arc<Stats>) -> Self {
        Self {
            cache,
            upstream,
            stats,
        }
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    pub async fn handle(&self, raw_query: &[u8], client: SocketAddr, sink: &dyn ReplySink) -> Outcome {
        let received_at = Instant::now();

        let query = match DnsQuery::parse(raw_query) {
            Ok(query) => query,
            Err(e) => {
                debug!(client = %client, error = %e, "dropping malformed query");
                self.stats.record_malformed();
                return Outcome::Malformed;
            }
        };

        let request = PendingRequest {
            raw_query,
            client,
            query,
            received_at,
        };

        let cacheable = request.query.is_cacheable();
        if cacheable {
            if let Some(cached) = self.cache.get(&request.query.key) {
                let response = dns::with_id(&cached, request.query.id);
                return self.reply(&request, &response, sink, Outcome::Cached).await;
            }
        }

        let upstream_start = Instant::now();
        let response = match self.upstream.resolve(request.raw_query).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_reset() {
                    warn!(
                        key = %request.query.key,
                        client = %request.client,
                        error = %e,
                        "upstream reset the connection, dropping query"
                    );
                    self.stats.record_upstream_reset();
                } else {
                    warn!(
                        key = %request.query.key,
                        client = %request.client,
                        error = %e,
                        "upstream unavailable, dropping query"
                    );
                }
                self.stats.record_unresolved();
                return Outcome::Unresolved;
            }
        };

        debug!(
            key = %request.query.key,
            upstream_ms = elapsed_ms(upstream_start),
            "resolved upstream"
        );

        if cacheable {
            self.cache.put(&request.query.key, &response);
        } else {
            debug!(
                key = %request.query.key,
                opcode = request.query.opcode,
                qdcount = request.query.qdcount,
                "not caching non-standard query"
            );
        }
        self.reply(&request, &response, sink, Outcome::Forwarded).await
    }

    async fn reply(
        &self,
        request: &PendingRequest<'_>,
        response: &[u8],
        sink: &dyn ReplySink,
        outcome: Outcome,
    ) -> Outcome {
        if let Err(e) = sink.send_reply(response, request.client).await {
            if is_transport_reset(&e) {
                debug!(client = %request.client, error = %e, "client went away before reply");
            } else {
                warn!(client = %request.client, error = %e, "failed to send reply");
            }
            self.stats.record_reply_failed();
            return Outcome::ReplyFailed;
        }

        let total_ms = elapsed_ms(request.received_at);
        match outcome {
            Outcome::Cached => {
                self.stats.record_cached(total_ms);
                debug!(key = %request.query.key, client = %request.client, total_ms, "CACHED");
            }
            _ => {
                self.stats.record_forwarded(total_ms);
                debug!(key = %request.query.key, client = %request.client, total_ms, "FORWARDED");
            }
        }
        outcome
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}
