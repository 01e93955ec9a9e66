//! Accept loop step that spawns, tracks and reaps connection workers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::acceptor::ConnectionAcceptor;
use super::worker::{run_worker, WorkerFactory};

/// What one [`WorkerSupervisor::handle_once`] call did after reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// No connection became ready within the accept timeout.
    Idle,
    /// A connection was accepted and a worker spawned under this id.
    Spawned(u64),
    /// A connection was accepted and closed because the worker limit was reached.
    Rejected,
    /// Accepting failed; nothing was registered.
    AcceptFailed,
}

/// Bookkeeping for one spawned worker.
///
/// The worker task owns the connection and closes it when it returns, so a
/// finished handle means the connection is already released.
struct WorkerEntry {
    peer: SocketAddr,
    handle: JoinHandle<()>,
}

/// Owns the listening socket and the registry of live workers.
///
/// The registry is only touched from the task calling
/// [`handle_once`](Self::handle_once); workers signal completion solely by
/// finishing their task.
pub struct WorkerSupervisor<F: WorkerFactory> {
    acceptor: ConnectionAcceptor,
    factory: F,
    workers: BTreeMap<u64, WorkerEntry>,
    next_id: u64,
    accept_timeout: Duration,
    max_workers: Option<usize>,
}

impl<F: WorkerFactory> WorkerSupervisor<F> {
    /// Create a supervisor over `acceptor`.
    pub fn new(acceptor: ConnectionAcceptor, factory: F, accept_timeout: Duration) -> Self {
        Self {
            acceptor,
            factory,
            workers: BTreeMap::new(),
            next_id: 0,
            accept_timeout,
            max_workers: None,
        }
    }

    /// Reject connections while `max` workers are live.
    pub fn with_max_workers(mut self, max: Option<usize>) -> Self {
        self.max_workers = max;
        self
    }

    /// Address of the listening socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Number of registered workers, finished or not.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True when no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Ids of registered workers, ascending.
    pub fn worker_ids(&self) -> Vec<u64> {
        self.workers.keys().copied().collect()
    }

    /// One supervisor step: reap finished workers, wait briefly for a
    /// connection and dispatch it to a new worker without waiting on it.
    pub async fn handle_once(&mut self) -> HandleOutcome {
        self.reap().await;

        if !self.acceptor.wait_readable(self.accept_timeout).await {
            return HandleOutcome::Idle;
        }

        let (stream, peer) = match self.acceptor.accept_one() {
            Some(Ok(accepted)) => accepted,
            Some(Err(e)) => {
                error!(error = %e, "Accept failed");
                return HandleOutcome::AcceptFailed;
            }
            None => return HandleOutcome::Idle,
        };

        if let Some(max) = self.max_workers {
            if self.workers.len() >= max {
                warn!(peer = %peer, max, "Worker limit reached, closing connection");
                drop(stream);
                return HandleOutcome::Rejected;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        info!(id, peer = %peer, "Spawning connection worker");

        let worker = self.factory.create(stream, peer);
        let handle = tokio::spawn(run_worker(id, peer, worker));
        self.workers.insert(id, WorkerEntry { peer, handle });
        HandleOutcome::Spawned(id)
    }

    /// Remove every finished worker, joining its task. Returns how many.
    pub async fn reap(&mut self) -> usize {
        let finished: Vec<u64> = self
            .workers
            .iter()
            .filter(|(_, entry)| entry.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in &finished {
            if let Some(entry) = self.workers.remove(id) {
                join_worker(*id, entry).await;
            }
        }
        finished.len()
    }

    /// Close the listener and wait for every worker.
    ///
    /// Workers still running after `drain_timeout` are aborted and joined,
    /// so no connection outlives this call.
    pub async fn shutdown(self, drain_timeout: Duration) {
        let Self {
            acceptor, workers, ..
        } = self;
        drop(acceptor);

        if !workers.is_empty() {
            info!(count = workers.len(), "Shutting down connection workers");
        }
        let deadline = Instant::now() + drain_timeout;
        for (id, mut entry) in workers {
            match tokio::time::timeout_at(deadline, &mut entry.handle).await {
                Ok(result) => log_join(id, entry.peer, result),
                Err(_) => {
                    warn!(id, peer = %entry.peer, "Worker did not finish, aborting");
                    entry.handle.abort();
                    join_worker(id, entry).await;
                }
            }
        }
    }
}

async fn join_worker(id: u64, entry: WorkerEntry) {
    let result = entry.handle.await;
    log_join(id, entry.peer, result);
}

fn log_join(id: u64, peer: SocketAddr, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => debug!(id, peer = %peer, "Reaped connection worker"),
        Err(e) if e.is_panic() => error!(id, peer = %peer, "Connection worker panicked"),
        Err(e) if e.is_cancelled() => debug!(id, peer = %peer, "Connection worker cancelled"),
        Err(e) => error!(id, peer = %peer, error = %e, "Connection worker join failed"),
    }
}
