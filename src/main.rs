use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dnsfwd::{BacklogPolicy, Proxy, ProxyConfig};

#[derive(Parser)]
#[command(name = "dnsfwd")]
#[command(about = "Caching DNS forwarding proxy", long_about = None)]
struct Args {
    /// Address to listen on for DNS queries
    #[arg(short, long, env = "DNSFWD_LISTEN", default_value = "0.0.0.0:53")]
    listen: SocketAddr,

    /// Upstream resolver address
    #[arg(short, long, env = "DNSFWD_UPSTREAM", default_value = "1.1.1.1")]
    upstream: IpAddr,

    /// Upstream resolver port, for both UDP and TCP
    #[arg(long, env = "DNSFWD_UPSTREAM_PORT", default_value = "53")]
    upstream_port: u16,

    /// Seconds a cached response stays fresh
    #[arg(long, env = "DNSFWD_CACHE_TTL", default_value = "60")]
    cache_ttl: u64,

    /// Maximum cached entries, 0 for unbounded
    #[arg(long, env = "DNSFWD_CACHE_MAX_ENTRIES", default_value = "10000")]
    cache_max_entries: usize,

    /// Maximum queries handled concurrently
    #[arg(short, long, env = "DNSFWD_WORKERS", default_value = "10")]
    workers: usize,

    /// What to do with queries when all workers are busy
    #[arg(long, env = "DNSFWD_BACKLOG", value_enum, default_value = "block")]
    backlog: BacklogPolicy,

    /// Per-attempt upstream timeout in milliseconds
    #[arg(long, env = "DNSFWD_TIMEOUT_MS", default_value = "3000")]
    timeout_ms: u64,

    /// Seconds between stats log lines, 0 to disable
    #[arg(long, env = "DNSFWD_STATS_INTERVAL", default_value = "60")]
    stats_interval: u64,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            listen_addr: self.listen,
            upstream_addr: SocketAddr::new(self.upstream, self.upstream_port),
            cache_ttl: Duration::from_secs(self.cache_ttl),
            cache_max_entries: self.cache_max_entries,
            workers: self.workers,
            backlog: self.backlog,
            timeout: Duration::from_millis(self.timeout_ms),
            stats_interval: (self.stats_interval > 0)
                .then(|| Duration::from_secs(self.stats_interval)),
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let proxy = match Proxy::bind(args.proxy_config()).await {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let handle = proxy.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("shutdown requested");
    handle.shutdown().await;

    ExitCode::SUCCESS
}
