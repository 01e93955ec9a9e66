//! Server and discovery configuration.

use std::time::Duration;

use crate::url::ServerUrl;

/// Default TCP service the server listens on.
pub const DEFAULT_SERVICE: &str = "55132";

/// Program tag used in advertised service names.
pub const PROGRAM_TAG: &str = "HalRemote";

/// Default listen backlog.
pub const DEFAULT_LISTEN_BACKLOG: u32 = 128;

/// Discovery backends that can be enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Multicast DNS / DNS-SD.
    Mdns,
    /// Simple Service Discovery Protocol.
    Ssdp,
}

/// Configuration for the discovery endpoint.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Backends to start, in merge order.
    pub backends: Vec<BackendKind>,
    /// How long an mDNS browse collects replies.
    pub browse_timeout: Duration,
    /// How long an SSDP search collects replies.
    pub search_window: Duration,
    /// Interval between periodic SSDP alive notifications.
    pub notify_interval: Duration,
    /// Peer identifier to advertise. Generated when unset.
    pub uuid: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::Mdns, BackendKind::Ssdp],
            browse_timeout: Duration::from_secs(1),
            search_window: Duration::from_secs(2),
            notify_interval: Duration::from_secs(60),
            uuid: None,
        }
    }
}

impl DiscoveryConfig {
    /// Select the backends to start.
    pub fn with_backends(mut self, backends: impl IntoIterator<Item = BackendKind>) -> Self {
        self.backends = backends.into_iter().collect();
        self
    }

    /// Set the mDNS browse timeout.
    pub fn with_browse_timeout(mut self, timeout: Duration) -> Self {
        self.browse_timeout = timeout;
        self
    }

    /// Set the SSDP search window.
    pub fn with_search_window(mut self, window: Duration) -> Self {
        self.search_window = window;
        self
    }

    /// Set the SSDP notify interval.
    pub fn with_notify_interval(mut self, interval: Duration) -> Self {
        self.notify_interval = interval;
        self
    }

    /// Use a fixed peer identifier.
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }
}

/// Configuration for the connection server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// URL to bind. Defaults to the dual-stack wildcard on [`DEFAULT_SERVICE`].
    pub bind: Option<ServerUrl>,
    /// Listen backlog.
    pub listen_backlog: u32,
    /// Bounded wait for a new connection in each supervisor pass.
    pub accept_timeout: Duration,
    /// Maximum number of live workers. `None` admits every connection.
    pub max_workers: Option<usize>,
    /// How long shutdown waits for workers before aborting them.
    pub drain_timeout: Duration,
    /// Whether to advertise the server via discovery.
    pub advertise: bool,
    /// Discovery settings.
    pub discovery: DiscoveryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: None,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            accept_timeout: Duration::from_millis(50),
            max_workers: None,
            drain_timeout: Duration::from_secs(5),
            advertise: true,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the bind URL.
    pub fn with_bind(mut self, url: ServerUrl) -> Self {
        self.bind = Some(url);
        self
    }

    /// Set the accept timeout.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Bound the number of live workers.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }

    /// Set the shutdown drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Enable or disable advertisement.
    pub fn with_advertise(mut self, advertise: bool) -> Self {
        self.advertise = advertise;
        self
    }

    /// Set discovery settings.
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }
}
