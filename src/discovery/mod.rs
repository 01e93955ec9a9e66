//! Service discovery: advertise this server and resolve remote ones.
//!
//! Each protocol lives behind the [`DiscoveryBackend`] trait. The
//! [`DiscoveryEndpoint`] owns the configured backends for the lifetime of
//! the process and merges their results.
//!
//! # Overview
//!
//! - **Advertise**: publish `<program tag> @ <host name>` with the peer
//!   uuid attached as metadata
//! - **Resolve**: browse, resolve every hit, then look up one address per
//!   requested family, producing `uuid -> family -> tcp://addr:port`
//! - **Merge**: later results overwrite earlier ones per `(uuid, family)`
//!
//! # Example
//!
//! ```ignore
//! use hal_remote::{AddressFamilyMask, DiscoveryConfig, DiscoveryEndpoint};
//!
//! let mut discovery = DiscoveryEndpoint::new(DiscoveryConfig::default());
//! discovery.start();
//! for (uuid, urls) in discovery.server_urls(AddressFamilyMask::ALL).await {
//!     println!("{uuid}: {urls:?}");
//! }
//! discovery.stop().await;
//! ```

mod endpoint;
pub mod mdns;
pub mod ssdp;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::config::PROGRAM_TAG;
use crate::url::{AddressFamily, AddressFamilyMask, ServerUrl};

pub use endpoint::DiscoveryEndpoint;

/// Metadata key carrying the peer identifier.
pub const UUID_KEY: &str = "uuid";

/// Longest service instance name, in bytes, accepted by DNS-SD.
pub const MAX_SERVICE_NAME_LEN: usize = 63;

/// Discovered servers: peer uuid to one URL per address family.
pub type PeerUrls = BTreeMap<String, BTreeMap<AddressFamily, ServerUrl>>;

/// A discovery protocol able to advertise and resolve servers.
///
/// Failures inside either operation are logged by the backend and never
/// returned: losing discoverability must not stop a server, and a broken
/// reply must not abort a resolve.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Human-readable name for logging (e.g. "mdns", "ssdp").
    fn name(&self) -> &'static str;

    /// Advertise this process under `uuid` on the decimal `service` port.
    ///
    /// A previous advertisement from the same backend is released first.
    async fn advertise(&mut self, uuid: &str, service: &str);

    /// Best-effort snapshot of servers currently discoverable.
    async fn resolve_all(&self, mask: AddressFamilyMask) -> PeerUrls;

    /// Release the advertisement, if any. Safe to call more than once.
    async fn teardown(&mut self);
}

/// Merge `from` into `into`; entries in `from` win per `(uuid, family)`.
pub fn merge_peer_urls(into: &mut PeerUrls, from: PeerUrls) {
    for (uuid, urls) in from {
        into.entry(uuid).or_default().extend(urls);
    }
}

/// Service instance name advertised for `host_name`.
pub fn service_name(host_name: &str) -> String {
    let mut name = format!("{PROGRAM_TAG} @ {host_name}");
    if name.len() > MAX_SERVICE_NAME_LEN {
        let mut end = MAX_SERVICE_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Local host name, or `"unknown"` when it cannot be read.
pub fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
