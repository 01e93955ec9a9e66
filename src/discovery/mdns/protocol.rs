//! Stage-by-stage DNS-SD operations used by the mDNS backend.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::url::{AddressFamily, NetworkPort};

/// Longest `key=value` entry a TXT record can carry.
pub const MAX_TXT_ENTRY_LEN: usize = 255;

/// Key/value metadata attached to an advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecord {
    entries: BTreeMap<String, Vec<u8>>,
}

impl TxtRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to raw `value` bytes.
    ///
    /// Keys must be non-empty printable ASCII without `=`, and the encoded
    /// `key=value` entry must fit in one length byte.
    pub fn insert(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() || !key.bytes().all(|b| (0x20..=0x7e).contains(&b) && b != b'=') {
            return Err(Error::Metadata(format!("invalid TXT key '{key}'")));
        }
        if key.len() + 1 + value.len() > MAX_TXT_ENTRY_LEN {
            return Err(Error::Metadata(format!(
                "TXT entry '{key}' exceeds {MAX_TXT_ENTRY_LEN} bytes"
            )));
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Value for `key` as text, lossily decoded.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_slice()))
    }
}

/// A service registration request.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Instance name.
    pub name: String,
    /// Shared service type.
    pub service_type: String,
    /// Listening port in network byte order.
    pub port: NetworkPort,
    /// Metadata.
    pub txt: TxtRecord,
}

/// Handle to an outstanding registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    fullname: String,
}

impl RegistrationHandle {
    /// Wrap the registered full service name.
    pub fn new(fullname: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
        }
    }

    /// Full service name, e.g. `HalRemote @ host._halremote._tcp.local.`.
    pub fn fullname(&self) -> &str {
        &self.fullname
    }
}

/// One browse reply naming an advertised instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseHit {
    /// Full service name.
    pub fullname: String,
    /// Service type the hit was found under.
    pub service_type: String,
}

impl BrowseHit {
    /// Create a hit.
    pub fn new(fullname: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            fullname: fullname.into(),
            service_type: service_type.into(),
        }
    }
}

/// Result of resolving a [`BrowseHit`].
#[derive(Debug, Clone)]
pub struct ResolvedService {
    /// Full service name.
    pub fullname: String,
    /// Target host name to look addresses up for.
    pub host_target: String,
    /// Port in network byte order.
    pub port: NetworkPort,
    /// Metadata.
    pub txt: TxtRecord,
}

/// DNS-SD operations, one method per pipeline stage.
///
/// `browse` reports per-reply errors inside its vector so that one broken
/// reply can be skipped without losing the others.
#[async_trait]
pub trait DnsSdProtocol: Send + Sync + 'static {
    /// Register a service. Domain and host are chosen automatically.
    fn register(&self, registration: Registration) -> Result<RegistrationHandle>;

    /// Release a registration.
    fn unregister(&self, handle: &RegistrationHandle) -> Result<()>;

    /// Enumerate instances of `service_type`.
    async fn browse(&self, service_type: &str) -> Result<Vec<Result<BrowseHit>>>;

    /// Resolve a hit to host, port and metadata.
    async fn resolve(&self, hit: &BrowseHit) -> Result<ResolvedService>;

    /// Look up an address for `host` on `family`.
    async fn lookup_address(&self, host: &str, family: AddressFamily) -> Result<Option<IpAddr>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt_record_holds_raw_bytes() {
        let mut txt = TxtRecord::new();
        txt.insert("uuid", b"abc-123").unwrap();
        assert_eq!(txt.get("uuid"), Some(&b"abc-123"[..]));
        assert_eq!(txt.get_str("uuid").as_deref(), Some("abc-123"));
        assert!(txt.get("missing").is_none());
    }

    #[test]
    fn txt_record_rejects_bad_keys() {
        let mut txt = TxtRecord::new();
        assert!(matches!(txt.insert("", b"x"), Err(Error::Metadata(_))));
        assert!(matches!(txt.insert("a=b", b"x"), Err(Error::Metadata(_))));
        assert!(matches!(txt.insert("caf\u{e9}", b"x"), Err(Error::Metadata(_))));
    }

    #[test]
    fn txt_record_rejects_oversized_entries() {
        let mut txt = TxtRecord::new();
        let value = vec![b'x'; MAX_TXT_ENTRY_LEN - 4];
        assert!(txt.insert("uuid", &value).is_err());
        assert!(txt.insert("uuid", &value[1..]).is_ok());
    }
}
