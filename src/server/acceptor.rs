//! The listening socket and its bounded-wait accept primitives.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::time::Duration;

use futures_util::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::debug;

use crate::config::DEFAULT_SERVICE;
use crate::error::{Error, Result};
use crate::url::{ServerUrl, TCP_SCHEME};

/// An accepted connection and its peer address.
pub type Accepted = (TcpStream, SocketAddr);

/// Whether this host can open IPv6 sockets.
pub fn is_ipv6_supported() -> bool {
    StdTcpListener::bind("[::]:0").is_ok()
}

/// Wildcard bind URL on the default service, dual-stack when possible.
pub fn default_bind_url() -> ServerUrl {
    let node = if is_ipv6_supported() { "::" } else { "0.0.0.0" };
    ServerUrl::new(TCP_SCHEME, node, DEFAULT_SERVICE)
}

/// Wraps one bound, listening socket.
///
/// [`wait_readable`](Self::wait_readable) blocks for at most its timeout;
/// a connection that arrives during the wait is held until
/// [`accept_one`](Self::accept_one) hands it out.
#[derive(Debug)]
pub struct ConnectionAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    ready: Option<std::io::Result<Accepted>>,
}

impl ConnectionAcceptor {
    /// Bind and listen on `url`. Service `0` picks a free port.
    pub async fn bind(url: &ServerUrl, backlog: u32) -> Result<Self> {
        let bind_error = |source: std::io::Error| Error::Bind {
            url: url.to_string(),
            source,
        };

        let addr = *url
            .resolve()
            .await?
            .first()
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_error)?;
        if addr.is_ipv6() {
            if let Err(e) = socket.set_only_v6(false) {
                debug!(url = %url, error = %e, "Dual-stack unavailable, serving IPv6 only");
            }
        }
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.bind(&addr.into()).map_err(bind_error)?;
        socket
            .listen(backlog.min(i32::MAX as u32) as i32)
            .map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;

        let listener = TcpListener::from_std(socket.into()).map_err(bind_error)?;
        Self::from_listener(listener)
    }

    /// Wrap an already listening tokio listener.
    pub fn from_listener(listener: TcpListener) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            ready: None,
        })
    }

    /// Address the socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait up to `timeout` for a pending connection.
    ///
    /// Returns `false` on timeout. Accept errors count as ready so that
    /// [`accept_one`](Self::accept_one) can report them.
    pub async fn wait_readable(&mut self, timeout: Duration) -> bool {
        if self.ready.is_some() {
            return true;
        }
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(result) => {
                self.ready = Some(result);
                true
            }
            Err(_) => false,
        }
    }

    /// Take a pending connection without blocking.
    ///
    /// `None` when nothing is pending; `Some(Err(_))` when the accept failed.
    pub fn accept_one(&mut self) -> Option<std::io::Result<Accepted>> {
        self.ready
            .take()
            .or_else(|| self.listener.accept().now_or_never())
    }

    /// Turn the acceptor into a plain stream of incoming connections.
    pub fn into_incoming(self) -> TcpListenerStream {
        TcpListenerStream::new(self.listener)
    }

    #[cfg(test)]
    pub(crate) fn set_ready(&mut self, ready: std::io::Result<Accepted>) {
        self.ready = Some(ready);
    }
}
