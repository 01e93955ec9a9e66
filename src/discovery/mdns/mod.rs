//! Multicast DNS / DNS-SD discovery backend.
//!
//! Resolution is a three-stage pipeline over a [`DnsSdProtocol`]:
//!
//! 1. **Browse** the shared service type; broken replies are skipped
//! 2. **Resolve** each hit to host, port and TXT record; hits without a
//!    `uuid` entry cannot be attributed to a peer and are dropped
//! 3. **Look up** one address per requested family, IPv4 first; a failed
//!    family never affects the other

mod daemon;
pub mod protocol;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, trace, warn};

use super::{local_host_name, service_name, DiscoveryBackend, PeerUrls, UUID_KEY};
use crate::error::Result;
use crate::url::{AddressFamily, AddressFamilyMask, NetworkPort, ServerUrl};

pub use daemon::MdnsSdProtocol;
pub use protocol::{
    BrowseHit, DnsSdProtocol, Registration, RegistrationHandle, ResolvedService, TxtRecord,
};

/// The DNS-SD service type shared by every server and client.
pub const SERVICE_TYPE: &str = "_halremote._tcp.local.";

/// A resolved hit attributed to a peer.
#[derive(Debug, Clone)]
struct AttributedService {
    uuid: String,
    service: ResolvedService,
}

/// mDNS discovery backend.
pub struct MdnsBackend<P: DnsSdProtocol = MdnsSdProtocol> {
    protocol: P,
    host_name: String,
    registration: Option<RegistrationHandle>,
}

impl MdnsBackend<MdnsSdProtocol> {
    /// Start an mDNS daemon and wrap it.
    pub fn new(browse_timeout: Duration) -> Result<Self> {
        Ok(Self::with_protocol(MdnsSdProtocol::new(browse_timeout)?))
    }
}

impl<P: DnsSdProtocol> MdnsBackend<P> {
    /// Wrap an existing protocol implementation.
    pub fn with_protocol(protocol: P) -> Self {
        Self {
            protocol,
            host_name: local_host_name(),
            registration: None,
        }
    }

    /// Override the host name used in the advertised service name.
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Whether a registration is outstanding.
    pub fn is_advertising(&self) -> bool {
        self.registration.is_some()
    }

    /// Access the protocol implementation.
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    fn release(&mut self) {
        if let Some(handle) = self.registration.take() {
            debug!(fullname = %handle.fullname(), "Releasing mDNS registration");
            if let Err(e) = self.protocol.unregister(&handle) {
                warn!(fullname = %handle.fullname(), error = %e, "mDNS unregister failed");
            }
        }
    }

    async fn browse_hits(&self) -> Vec<BrowseHit> {
        let replies = match self.protocol.browse(SERVICE_TYPE).await {
            Ok(replies) => replies,
            Err(e) => {
                error!(service_type = SERVICE_TYPE, error = %e, "mDNS browse failed");
                return Vec::new();
            }
        };

        replies
            .into_iter()
            .filter_map(|reply| match reply {
                Ok(hit) => Some(hit),
                Err(e) => {
                    error!(error = %e, "mDNS browse reply error");
                    None
                }
            })
            .collect()
    }

    async fn resolve_hits(&self, hits: Vec<BrowseHit>) -> Vec<AttributedService> {
        let mut resolved = Vec::with_capacity(hits.len());
        for hit in hits {
            debug!(fullname = %hit.fullname, "mDNS resolving");
            let service = match self.protocol.resolve(&hit).await {
                Ok(service) => service,
                Err(e) => {
                    error!(fullname = %hit.fullname, error = %e, "mDNS resolve failed");
                    continue;
                }
            };
            match service.txt.get_str(UUID_KEY).filter(|uuid| !uuid.is_empty()) {
                Some(uuid) => resolved.push(AttributedService { uuid, service }),
                None => error!(
                    host = %service.host_target,
                    "mDNS resolve missing uuid record"
                ),
            }
        }
        resolved
    }

    async fn lookup_addresses(
        &self,
        services: Vec<AttributedService>,
        mask: AddressFamilyMask,
    ) -> PeerUrls {
        let mut result = PeerUrls::new();
        for attributed in services {
            let service = &attributed.service;
            for family in mask.families() {
                let Some(ip) = self.lookup_one(&service.host_target, family).await else {
                    continue;
                };
                let url = ServerUrl::from_ip(ip, service.port);
                debug!(
                    url = %url,
                    uuid = %attributed.uuid,
                    family = %family,
                    "mDNS discovered"
                );
                result
                    .entry(attributed.uuid.clone())
                    .or_default()
                    .insert(family, url);
            }
        }
        result
    }

    async fn lookup_one(&self, host: &str, family: AddressFamily) -> Option<IpAddr> {
        match self.protocol.lookup_address(host, family).await {
            Ok(Some(ip)) if family.matches(&ip) => Some(ip),
            Ok(Some(ip)) => {
                warn!(host, family = %family, address = %ip, "mDNS lookup returned wrong family");
                None
            }
            Ok(None) => {
                trace!(host, family = %family, "mDNS lookup found no address");
                None
            }
            Err(e) => {
                warn!(host, family = %family, error = %e, "mDNS address lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl<P: DnsSdProtocol> DiscoveryBackend for MdnsBackend<P> {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn advertise(&mut self, uuid: &str, service: &str) {
        let name = service_name(&self.host_name);

        let mut txt = TxtRecord::new();
        if let Err(e) = txt.insert(UUID_KEY, uuid.as_bytes()) {
            error!(error = %e, "mDNS TXT record construction failed");
            return;
        }

        let port = match NetworkPort::from_service(service) {
            Ok(port) => port,
            Err(e) => {
                error!(service, error = %e, "mDNS advertise with bad port");
                return;
            }
        };

        self.release();

        info!(name = %name, port = port.host(), "mDNS registering service");
        let registration = Registration {
            name,
            service_type: SERVICE_TYPE.to_string(),
            port,
            txt,
        };
        match self.protocol.register(registration) {
            Ok(handle) => self.registration = Some(handle),
            Err(e) => error!(error = %e, "mDNS register failed"),
        }
    }

    async fn resolve_all(&self, mask: AddressFamilyMask) -> PeerUrls {
        let hits = self.browse_hits().await;
        let resolved = self.resolve_hits(hits).await;
        self.lookup_addresses(resolved, mask).await
    }

    async fn teardown(&mut self) {
        self.release();
    }
}

impl<P: DnsSdProtocol> Drop for MdnsBackend<P> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted protocol: fixed browse replies, resolutions and addresses.
    #[derive(Default)]
    struct ScriptedProtocol {
        replies: Vec<std::result::Result<BrowseHit, String>>,
        resolutions: HashMap<String, ResolvedService>,
        addresses: HashMap<(String, AddressFamily), IpAddr>,
        failing_lookups: Vec<(String, AddressFamily)>,
        registered: Mutex<Vec<Registration>>,
        unregistered: Mutex<Vec<String>>,
        fail_register: bool,
    }

    impl ScriptedProtocol {
        fn hit(mut self, fullname: &str) -> Self {
            self.replies.push(Ok(BrowseHit::new(fullname, SERVICE_TYPE)));
            self
        }

        fn broken_reply(mut self) -> Self {
            self.replies.push(Err("reply error -65537".into()));
            self
        }

        fn resolves(mut self, fullname: &str, host: &str, port: u16, uuid: Option<&str>) -> Self {
            let mut txt = TxtRecord::new();
            if let Some(uuid) = uuid {
                txt.insert(UUID_KEY, uuid.as_bytes()).unwrap();
            }
            self.resolutions.insert(
                fullname.to_string(),
                ResolvedService {
                    fullname: fullname.to_string(),
                    host_target: host.to_string(),
                    port: NetworkPort::from_host(port),
                    txt,
                },
            );
            self
        }

        fn address(mut self, host: &str, ip: &str) -> Self {
            let ip: IpAddr = ip.parse().unwrap();
            self.addresses
                .insert((host.to_string(), AddressFamily::of(&ip)), ip);
            self
        }

        fn failing_lookup(mut self, host: &str, family: AddressFamily) -> Self {
            self.failing_lookups.push((host.to_string(), family));
            self
        }
    }

    #[async_trait]
    impl DnsSdProtocol for ScriptedProtocol {
        fn register(&self, registration: Registration) -> Result<RegistrationHandle> {
            if self.fail_register {
                return Err(Error::protocol("register error -65540"));
            }
            let handle = RegistrationHandle::new(format!("{}.{}", registration.name, SERVICE_TYPE));
            self.registered.lock().unwrap().push(registration);
            Ok(handle)
        }

        fn unregister(&self, handle: &RegistrationHandle) -> Result<()> {
            self.unregistered
                .lock()
                .unwrap()
                .push(handle.fullname().to_string());
            Ok(())
        }

        async fn browse(&self, _service_type: &str) -> Result<Vec<Result<BrowseHit>>> {
            Ok(self
                .replies
                .iter()
                .map(|reply| reply.clone().map_err(Error::protocol))
                .collect())
        }

        async fn resolve(&self, hit: &BrowseHit) -> Result<ResolvedService> {
            self.resolutions
                .get(&hit.fullname)
                .cloned()
                .ok_or_else(|| Error::protocol("resolve timed out"))
        }

        async fn lookup_address(
            &self,
            host: &str,
            family: AddressFamily,
        ) -> Result<Option<IpAddr>> {
            if self
                .failing_lookups
                .iter()
                .any(|(h, f)| h == host && *f == family)
            {
                return Err(Error::protocol("lookup error"));
            }
            Ok(self.addresses.get(&(host.to_string(), family)).copied())
        }
    }

    fn url(s: &str) -> ServerUrl {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn resolves_single_ipv4_peer() {
        let protocol = ScriptedProtocol::default()
            .hit("a")
            .resolves("a", "bench.local.", 55132, Some("abc-123"))
            .address("bench.local.", "10.0.0.5");
        let backend = MdnsBackend::with_protocol(protocol);

        let result = backend.resolve_all(AddressFamilyMask::IPV4).await;

        assert_eq!(result.len(), 1);
        assert_eq!(result["abc-123"].len(), 1);
        assert_eq!(
            result["abc-123"][&AddressFamily::Ipv4],
            url("tcp://10.0.0.5:55132")
        );
    }

    #[tokio::test]
    async fn empty_uuid_is_treated_as_missing() {
        let protocol = ScriptedProtocol::default()
            .hit("blank-1")
            .hit("blank-2")
            .resolves("blank-1", "x.local.", 1, Some(""))
            .resolves("blank-2", "y.local.", 2, Some(""))
            .address("x.local.", "10.0.0.1")
            .address("y.local.", "10.0.0.2");
        let backend = MdnsBackend::with_protocol(protocol);

        let result = backend.resolve_all(AddressFamilyMask::ALL).await;

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn missing_uuid_is_skipped_without_aborting() {
        let protocol = ScriptedProtocol::default()
            .hit("anonymous")
            .hit("named")
            .resolves("anonymous", "x.local.", 1, None)
            .resolves("named", "y.local.", 2, Some("peer"))
            .address("x.local.", "10.0.0.1")
            .address("y.local.", "10.0.0.2");
        let backend = MdnsBackend::with_protocol(protocol);

        let result = backend.resolve_all(AddressFamilyMask::ALL).await;

        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["peer"]);
        assert_eq!(result["peer"][&AddressFamily::Ipv4], url("tcp://10.0.0.2:2"));
    }

    #[tokio::test]
    async fn broken_replies_and_failed_resolves_are_skipped() {
        let protocol = ScriptedProtocol::default()
            .broken_reply()
            .hit("unresolvable")
            .hit("good")
            .resolves("good", "g.local.", 9, Some("g"))
            .address("g.local.", "192.168.1.9");
        let backend = MdnsBackend::with_protocol(protocol);

        let result = backend.resolve_all(AddressFamilyMask::IPV4).await;

        assert_eq!(result.len(), 1);
        assert_eq!(result["g"][&AddressFamily::Ipv4], url("tcp://192.168.1.9:9"));
    }

    #[tokio::test]
    async fn one_family_failure_keeps_the_other() {
        let protocol = ScriptedProtocol::default()
            .hit("a")
            .resolves("a", "h.local.", 7, Some("u"))
            .failing_lookup("h.local.", AddressFamily::Ipv4)
            .address("h.local.", "fe80::2");
        let backend = MdnsBackend::with_protocol(protocol);

        let result = backend.resolve_all(AddressFamilyMask::ALL).await;

        assert_eq!(result["u"].len(), 1);
        assert_eq!(result["u"][&AddressFamily::Ipv6], url("tcp://[fe80::2]:7"));
    }

    #[tokio::test]
    async fn same_uuid_under_two_names_merges_later_wins() {
        let protocol = ScriptedProtocol::default()
            .hit("first")
            .hit("second")
            .resolves("first", "one.local.", 1000, Some("dup"))
            .resolves("second", "two.local.", 2000, Some("dup"))
            .address("one.local.", "10.0.0.1")
            .address("one.local.", "fe80::1")
            .address("two.local.", "10.0.0.2");
        let backend = MdnsBackend::with_protocol(protocol);

        let result = backend.resolve_all(AddressFamilyMask::ALL).await;

        assert_eq!(result.len(), 1);
        assert_eq!(result["dup"].len(), 2);
        assert_eq!(result["dup"][&AddressFamily::Ipv4], url("tcp://10.0.0.2:2000"));
        assert_eq!(result["dup"][&AddressFamily::Ipv6], url("tcp://[fe80::1]:1000"));
    }

    #[tokio::test]
    async fn mask_limits_lookups() {
        let protocol = ScriptedProtocol::default()
            .hit("a")
            .resolves("a", "h.local.", 7, Some("u"))
            .address("h.local.", "10.1.1.1")
            .address("h.local.", "fe80::7");
        let backend = MdnsBackend::with_protocol(protocol);

        let v6 = backend.resolve_all(AddressFamilyMask::IPV6).await;
        assert_eq!(v6["u"].keys().collect::<Vec<_>>(), vec![&AddressFamily::Ipv6]);

        let none = backend.resolve_all(AddressFamilyMask::NONE).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn advertise_registers_name_uuid_and_port() {
        let mut backend =
            MdnsBackend::with_protocol(ScriptedProtocol::default()).host_name("bench");

        backend.advertise("abc-123", "55132").await;

        assert!(backend.is_advertising());
        let registered = backend.protocol().registered.lock().unwrap().clone();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].name, "HalRemote @ bench");
        assert_eq!(registered[0].service_type, SERVICE_TYPE);
        assert_eq!(registered[0].port.wire(), 55132u16.to_be());
        assert_eq!(registered[0].txt.get(UUID_KEY), Some(&b"abc-123"[..]));
    }

    #[tokio::test]
    async fn readvertise_releases_previous_registration() {
        let mut backend =
            MdnsBackend::with_protocol(ScriptedProtocol::default()).host_name("bench");

        backend.advertise("abc-123", "1000").await;
        backend.advertise("abc-123", "2000").await;
        backend.teardown().await;
        backend.teardown().await;

        let unregistered = backend.protocol().unregistered.lock().unwrap().clone();
        assert_eq!(unregistered.len(), 2);
        assert!(!backend.is_advertising());
    }

    #[tokio::test]
    async fn register_failure_is_not_fatal() {
        let protocol = ScriptedProtocol {
            fail_register: true,
            ..Default::default()
        };
        let mut backend = MdnsBackend::with_protocol(protocol);

        backend.advertise("abc-123", "55132").await;

        assert!(!backend.is_advertising());
    }

    #[tokio::test]
    async fn bad_port_or_metadata_aborts_registration() {
        let mut backend = MdnsBackend::with_protocol(ScriptedProtocol::default());

        backend.advertise("abc-123", "not-a-port").await;
        backend.advertise(&"u".repeat(300), "55132").await;

        assert!(!backend.is_advertising());
        assert!(backend.protocol().registered.lock().unwrap().is_empty());
    }
}
