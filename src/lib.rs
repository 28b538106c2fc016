//! dnsfwd - a caching DNS forwarding proxy.
//!
//! Queries arriving on a local UDP listener are answered from an in-memory
//! TTL cache when possible and otherwise forwarded verbatim to a single
//! upstream resolver, over UDP with a one-shot TCP fallback.

pub mod cache;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod handler;
pub mod proxy;
pub mod stats;
pub mod transport;

pub use cache::{Clock, DnsCache, ManualClock, SystemClock};
pub use dispatcher::{BacklogPolicy, Dispatcher, Submission};
pub use dns::{CacheKey, DnsQuery};
pub use error::{ConfigError, ParseError, ProxyError, Result, UpstreamError};
pub use handler::{Outcome, ReplySink, RequestHandler};
pub use proxy::{Proxy, ProxyConfig, ProxyHandle};
pub use stats::{Stats, StatsSnapshot};
pub use transport::{Upstream, UpstreamClient, UpstreamResult};
