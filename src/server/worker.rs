//! Per-connection workers.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::error::Result;

/// Runs the protocol for one accepted connection.
#[async_trait]
pub trait ConnectionWorker: Send + 'static {
    /// Perform one unit of protocol work.
    ///
    /// Returns `Ok(false)` once the peer has disconnected cleanly and no
    /// further calls should be made. An error also ends the connection.
    async fn handle_once(&mut self) -> Result<bool>;
}

/// Builds a worker for each accepted connection.
pub trait WorkerFactory: Send + Sync + 'static {
    /// Worker type produced.
    type Worker: ConnectionWorker;

    /// Take ownership of `stream` and build its worker.
    fn create(&self, stream: TcpStream, peer: SocketAddr) -> Self::Worker;
}

impl<F, W> WorkerFactory for F
where
    F: Fn(TcpStream, SocketAddr) -> W + Send + Sync + 'static,
    W: ConnectionWorker,
{
    type Worker = W;

    fn create(&self, stream: TcpStream, peer: SocketAddr) -> W {
        self(stream, peer)
    }
}

/// Drive `worker` until the peer leaves or the worker fails.
///
/// Errors stop the loop here and are logged; they never reach the
/// supervisor.
pub(crate) async fn run_worker<W: ConnectionWorker>(id: u64, peer: SocketAddr, mut worker: W) {
    loop {
        match worker.handle_once().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(id, peer = %peer, "Peer disconnected");
                break;
            }
            Err(e) => {
                error!(id, peer = %peer, error = %e, "Worker failed");
                break;
            }
        }
    }
}

/// Worker that writes back whatever it reads.
pub struct EchoWorker {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl EchoWorker {
    /// Wrap an accepted connection.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: vec![0u8; 4096],
        }
    }
}

#[async_trait]
impl ConnectionWorker for EchoWorker {
    async fn handle_once(&mut self) -> Result<bool> {
        let n = self.stream.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(false);
        }
        self.stream.write_all(&self.buf[..n]).await?;
        Ok(true)
    }
}
