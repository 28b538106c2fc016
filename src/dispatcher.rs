//! Bounded worker pool between the listener and the request handler.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::handler::{ReplySink, RequestHandler};
use crate::stats::Stats;

/// Pool ceiling used when none is configured.
pub const DEFAULT_WORKERS: usize = 10;

/// What to do with a datagram when every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BacklogPolicy {
    /// Wait for a worker. The acceptor stops reading, so new datagrams queue
    /// in the socket's receive buffer until the kernel drops them.
    #[default]
    Block,
    /// Discard the datagram and count it as rejected.
    Drop,
}

/// Whether a datagram was handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Rejected,
}

/// Runs [`RequestHandler::handle`] for each submitted datagram on at most
/// `workers` concurrent tasks. Completion order is unspecified.
pub struct Dispatcher {
    handler: Arc<RequestHandler>,
    sink: Arc<dyn ReplySink>,
    permits: Arc<Semaphore>,
    capacity: usize,
    policy: BacklogPolicy,
    tasks: JoinSet<()>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<RequestHandler>,
        sink: Arc<dyn ReplySink>,
        workers: usize,
        policy: BacklogPolicy,
        stats: Arc<Stats>,
    ) -> Self {
        let capacity = workers.max(1);
        Self {
            handler,
            sink,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            policy,
            tasks: JoinSet::new(),
            stats,
        }
    }

    /// Hand `datagram` to a worker, waiting for one under
    /// [`BacklogPolicy::Block`].
    pub async fn submit(&mut self, datagram: Vec<u8>, client: SocketAddr) -> Submission {
        self.reap();

        let permit = match self.policy {
            BacklogPolicy::Block => match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Submission::Rejected,
            },
            BacklogPolicy::Drop => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(client = %client, workers = self.capacity, "all workers busy, dropping query");
                    self.stats.record_rejected();
                    return Submission::Rejected;
                }
            },
        };

        let handler = self.handler.clone();
        let sink = self.sink.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            handler.handle(&datagram, client, sink.as_ref()).await;
        });

        Submission::Accepted
    }

    /// Number of workers currently running a request.
    pub fn busy(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for every in-flight request to finish.
    pub async fn drain(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            log_join_error(result);
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            log_join_error(result);
        }
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("request worker panicked: {e}");
        }
    }
}
