//! [`DnsSdProtocol`] on top of the pure-Rust `mdns-sd` daemon.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::protocol::{
    BrowseHit, DnsSdProtocol, Registration, RegistrationHandle, ResolvedService, TxtRecord,
};
use crate::discovery::local_host_name;
use crate::error::{Error, Result};
use crate::url::{AddressFamily, NetworkPort};

/// DNS-SD over an `mdns-sd` [`ServiceDaemon`].
///
/// The daemon resolves instances while browsing. Each browse replaces the
/// resolution cache with what it saw, so resolve and address lookup only
/// ever answer from the latest browse. Address lookups fall back to the
/// system resolver when the cache has nothing for a family.
pub struct MdnsSdProtocol {
    daemon: ServiceDaemon,
    browse_timeout: Duration,
    resolved: ResolutionCache,
}

impl MdnsSdProtocol {
    /// Start the daemon thread.
    pub fn new(browse_timeout: Duration) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            browse_timeout,
            resolved: ResolutionCache::default(),
        })
    }
}

/// Resolutions seen by the most recent browse, keyed by full name.
#[derive(Default)]
struct ResolutionCache {
    entries: Mutex<HashMap<String, ServiceInfo>>,
}

impl ResolutionCache {
    async fn replace(&self, entries: HashMap<String, ServiceInfo>) {
        *self.entries.lock().await = entries;
    }

    async fn resolve(&self, hit: &BrowseHit) -> Result<ResolvedService> {
        let entries = self.entries.lock().await;
        let info = entries
            .get(&hit.fullname)
            .ok_or_else(|| Error::protocol(format!("no resolution for {}", hit.fullname)))?;

        let txt = txt_record(
            info.get_properties()
                .iter()
                .map(|property| (property.key(), property.val())),
        );

        Ok(ResolvedService {
            fullname: hit.fullname.clone(),
            host_target: info.get_hostname().to_string(),
            port: NetworkPort::from_host(info.get_port()),
            txt,
        })
    }

    async fn addresses(&self, host: &str, family: AddressFamily) -> Vec<IpAddr> {
        let entries = self.entries.lock().await;
        let mut addrs: Vec<IpAddr> = entries
            .values()
            .filter(|info| info.get_hostname() == host)
            .flat_map(|info| info.get_addresses().iter().copied())
            .filter(|ip| family.matches(ip))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        addrs.sort();
        addrs
    }
}

/// Everything one browse produced.
struct BrowseBatch {
    replies: Vec<Result<BrowseHit>>,
    resolved: HashMap<String, ServiceInfo>,
}

/// Drain daemon events until `deadline`.
async fn collect_browse(receiver: &flume::Receiver<ServiceEvent>, deadline: Instant) -> BrowseBatch {
    let mut seen = HashSet::new();
    let mut batch = BrowseBatch {
        replies: Vec::new(),
        resolved: HashMap::new(),
    };

    loop {
        let event = match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
            Err(_) => break,
            Ok(Err(flume::RecvError::Disconnected)) => {
                batch
                    .replies
                    .push(Err(Error::protocol("mDNS daemon closed the browse channel")));
                break;
            }
            Ok(Ok(event)) => event,
        };

        match event {
            ServiceEvent::ServiceFound(ty, fullname) => {
                trace!(fullname = %fullname, "mDNS browse reply");
                if seen.insert(fullname.clone()) {
                    batch.replies.push(Ok(BrowseHit::new(fullname, ty)));
                }
            }
            ServiceEvent::ServiceResolved(info) => {
                let fullname = info.get_fullname().to_string();
                trace!(fullname = %fullname, host = %info.get_hostname(), "mDNS resolved");
                if seen.insert(fullname.clone()) {
                    batch
                        .replies
                        .push(Ok(BrowseHit::new(fullname.clone(), info.get_type())));
                }
                batch.resolved.insert(fullname, info);
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                debug!(fullname = %fullname, "mDNS service removed");
                batch.resolved.remove(&fullname);
            }
            _ => {}
        }
    }
    batch
}

/// Build a [`TxtRecord`] from decoded properties.
///
/// A key without `=` carries no value and is left out, so it reads as
/// missing rather than empty.
fn txt_record<'a>(properties: impl IntoIterator<Item = (&'a str, Option<&'a [u8]>)>) -> TxtRecord {
    let mut txt = TxtRecord::new();
    for (key, value) in properties {
        let Some(value) = value else {
            trace!(key, "Skipping TXT key without value");
            continue;
        };
        if let Err(e) = txt.insert(key, value) {
            trace!(error = %e, "Skipping TXT entry");
        }
    }
    txt
}

#[async_trait]
impl DnsSdProtocol for MdnsSdProtocol {
    fn register(&self, registration: Registration) -> Result<RegistrationHandle> {
        let host_name = format!("{}.local.", local_host_name());
        let properties: HashMap<String, String> = registration
            .txt
            .iter()
            .map(|(key, value)| (key.to_string(), String::from_utf8_lossy(value).into_owned()))
            .collect();

        let info = ServiceInfo::new(
            &registration.service_type,
            &registration.name,
            &host_name,
            "",
            registration.port.host(),
            properties,
        )?
        .enable_addr_auto();

        let handle = RegistrationHandle::new(info.get_fullname());
        self.daemon.register(info)?;
        Ok(handle)
    }

    fn unregister(&self, handle: &RegistrationHandle) -> Result<()> {
        // Dropping the status receiver is fine, the goodbye is still sent.
        self.daemon.unregister(handle.fullname())?;
        Ok(())
    }

    async fn browse(&self, service_type: &str) -> Result<Vec<Result<BrowseHit>>> {
        let receiver = self.daemon.browse(service_type)?;
        let batch = collect_browse(&receiver, Instant::now() + self.browse_timeout).await;

        if let Err(e) = self.daemon.stop_browse(service_type) {
            debug!(error = %e, "mDNS stop_browse failed");
        }
        self.resolved.replace(batch.resolved).await;
        Ok(batch.replies)
    }

    async fn resolve(&self, hit: &BrowseHit) -> Result<ResolvedService> {
        self.resolved.resolve(hit).await
    }

    async fn lookup_address(&self, host: &str, family: AddressFamily) -> Result<Option<IpAddr>> {
        if let Some(ip) = self.resolved.addresses(host, family).await.into_iter().next() {
            return Ok(Some(ip));
        }

        let name = host.trim_end_matches('.');
        let found = tokio::net::lookup_host((name, 0))
            .await?
            .map(|addr| addr.ip())
            .find(|ip| family.matches(ip));
        Ok(found)
    }
}

impl Drop for MdnsSdProtocol {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}
