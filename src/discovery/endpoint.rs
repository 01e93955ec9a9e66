//! Process-level discovery facade over the configured backends.

use tracing::{debug, info, warn};

use super::mdns::MdnsBackend;
use super::ssdp::SsdpBackend;
use super::{merge_peer_urls, DiscoveryBackend, PeerUrls};
use crate::config::{BackendKind, DiscoveryConfig};
use crate::url::AddressFamilyMask;

/// Owns the discovery backends of one process.
///
/// Construct it once, [`start`](Self::start) it, pass it to whatever needs
/// to advertise or resolve, and [`stop`](Self::stop) it on shutdown.
/// Dropping it also releases every advertisement.
pub struct DiscoveryEndpoint {
    config: DiscoveryConfig,
    uuid: String,
    backends: Vec<Box<dyn DiscoveryBackend>>,
    started: bool,
}

impl DiscoveryEndpoint {
    /// Create a stopped endpoint. A peer uuid is generated unless configured.
    pub fn new(config: DiscoveryConfig) -> Self {
        let uuid = config
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            config,
            uuid,
            backends: Vec::new(),
            started: false,
        }
    }

    /// Create a started endpoint over explicit backends.
    pub fn with_backends(config: DiscoveryConfig, backends: Vec<Box<dyn DiscoveryBackend>>) -> Self {
        let mut endpoint = Self::new(config);
        endpoint.backends = backends;
        endpoint.started = true;
        endpoint
    }

    /// Peer identifier advertised by this process.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Names of the running backends, in merge order.
    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    /// Start the configured backends.
    ///
    /// A backend that cannot start on this host is left out; the others
    /// keep working.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        for kind in &self.config.backends {
            match kind {
                BackendKind::Mdns => match MdnsBackend::new(self.config.browse_timeout) {
                    Ok(backend) => self.backends.push(Box::new(backend)),
                    Err(e) => warn!(error = %e, "mDNS unavailable, continuing without it"),
                },
                BackendKind::Ssdp => self.backends.push(Box::new(SsdpBackend::new(&self.config))),
            }
        }
        self.started = true;
        info!(backends = ?self.backend_names(), uuid = %self.uuid, "Discovery started");
    }

    /// Advertise this process on the decimal `service` port.
    pub async fn advertise_service(&mut self, service: &str) {
        for backend in &mut self.backends {
            debug!(backend = backend.name(), service, "Advertising");
            backend.advertise(&self.uuid, service).await;
        }
    }

    /// Discoverable servers across all backends.
    ///
    /// Backends are queried in order; later backends win per
    /// `(uuid, family)`.
    pub async fn server_urls(&self, mask: AddressFamilyMask) -> PeerUrls {
        let mut result = PeerUrls::new();
        for backend in &self.backends {
            let found = backend.resolve_all(mask).await;
            debug!(backend = backend.name(), peers = found.len(), "Resolve finished");
            merge_peer_urls(&mut result, found);
        }
        result
    }

    /// Release all advertisements and drop the backends.
    pub async fn stop(&mut self) {
        for backend in &mut self.backends {
            backend.teardown().await;
        }
        if !self.backends.is_empty() {
            info!("Discovery stopped");
        }
        self.backends.clear();
        self.started = false;
    }
}
