//! Connection server: bind, advertise, supervise workers, tear down.

mod acceptor;
mod supervisor;
mod worker;

use std::net::SocketAddr;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{error, info};

pub use acceptor::{default_bind_url, is_ipv6_supported, Accepted, ConnectionAcceptor};
pub use supervisor::{HandleOutcome, WorkerSupervisor};
pub use worker::{ConnectionWorker, EchoWorker, WorkerFactory};

use crate::config::{ServerConfig, DEFAULT_SERVICE};
use crate::discovery::DiscoveryEndpoint;
use crate::error::Result;
use crate::url::{ServerUrl, TCP_SCHEME};

/// A bound server ready to run.
///
/// ```ignore
/// let server = Server::bind(ServerConfig::default()).await?;
/// let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
/// server.run(|stream, _peer| EchoWorker::new(stream), shutdown_rx).await?;
/// ```
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    url: ServerUrl,
    acceptor: ConnectionAcceptor,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Failing to bind is the one fatal startup error: nothing is
    /// advertised or accepted.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let mut url = config.bind.clone().unwrap_or_else(default_bind_url);
        if url.scheme().is_empty() {
            url.set_scheme(TCP_SCHEME);
        }
        if url.service().is_empty() {
            url.set_service(DEFAULT_SERVICE);
        }

        info!(url = %url, "Launching the server");
        let acceptor = match ConnectionAcceptor::bind(&url, config.listen_backlog).await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!(url = %url, error = %e, "Server socket bind failed");
                return Err(e);
            }
        };
        info!(local_addr = %acceptor.local_addr(), "Server bound");

        Ok(Self {
            config,
            url,
            acceptor,
        })
    }

    /// URL the server was asked to bind.
    pub fn url(&self) -> &ServerUrl {
        &self.url
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Serve until `shutdown_rx` fires or its sender is dropped.
    ///
    /// Shutdown is checked between supervisor steps, so it is observed
    /// within one accept timeout. Teardown runs in reverse order:
    /// discovery, listener, then workers.
    pub async fn run<F: WorkerFactory>(
        self,
        factory: F,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let port = self.local_addr().port();
        let mut discovery = DiscoveryEndpoint::new(self.config.discovery.clone());
        if self.config.advertise {
            discovery.start();
            discovery.advertise_service(&port.to_string()).await;
        }

        let mut supervisor =
            WorkerSupervisor::new(self.acceptor, factory, self.config.accept_timeout)
                .with_max_workers(self.config.max_workers);

        info!(port, "Serving connections");
        loop {
            match shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }
            supervisor.handle_once().await;
        }

        info!("Shutdown requested");
        discovery.stop().await;
        supervisor.shutdown(self.config.drain_timeout).await;
        info!("Cleanup complete");
        Ok(())
    }
}
