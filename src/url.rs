//! Canonical server URLs, address families and wire port encoding.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::BitOr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Scheme used for every RPC endpoint URL.
pub const TCP_SCHEME: &str = "tcp";

/// An IP address family a peer can be reached on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressFamily {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
}

impl AddressFamily {
    /// Families in the fixed order lookups are attempted.
    pub const ALL: [AddressFamily; 2] = [AddressFamily::Ipv4, AddressFamily::Ipv6];

    /// Family of an address.
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// Whether `ip` belongs to this family.
    pub fn matches(self, ip: &IpAddr) -> bool {
        Self::of(ip) == self
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("IPv4"),
            AddressFamily::Ipv6 => f.write_str("IPv6"),
        }
    }
}

/// Set of address families requested from a resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AddressFamilyMask(u8);

impl AddressFamilyMask {
    /// No family.
    pub const NONE: Self = Self(0);
    /// IPv4 only.
    pub const IPV4: Self = Self(0b01);
    /// IPv6 only.
    pub const IPV6: Self = Self(0b10);
    /// IPv4 and IPv6.
    pub const ALL: Self = Self(0b11);

    /// Whether `family` is part of the mask.
    pub fn contains(self, family: AddressFamily) -> bool {
        self.0 & Self::from(family).0 != 0
    }

    /// Requested families, IPv4 first.
    pub fn families(self) -> impl Iterator<Item = AddressFamily> {
        AddressFamily::ALL
            .into_iter()
            .filter(move |family| self.contains(*family))
    }

    /// True when no family is requested.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<AddressFamily> for AddressFamilyMask {
    fn from(family: AddressFamily) -> Self {
        match family {
            AddressFamily::Ipv4 => Self::IPV4,
            AddressFamily::Ipv6 => Self::IPV6,
        }
    }
}

impl BitOr for AddressFamilyMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A TCP port held in network byte order, as carried by discovery records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkPort(u16);

impl NetworkPort {
    /// Convert a host-order port.
    pub fn from_host(port: u16) -> Self {
        Self(port.to_be())
    }

    /// Wrap a value that is already in network byte order.
    pub fn from_wire(raw: u16) -> Self {
        Self(raw)
    }

    /// Parse a decimal service string such as `"55132"`.
    pub fn from_service(service: &str) -> Result<Self> {
        service
            .trim()
            .parse::<u16>()
            .map(Self::from_host)
            .map_err(|_| Error::InvalidPort(service.to_string()))
    }

    /// The value in network byte order.
    pub fn wire(self) -> u16 {
        self.0
    }

    /// The port in host byte order.
    pub fn host(self) -> u16 {
        u16::from_be(self.0)
    }

    /// Decimal service string in host order.
    pub fn to_service(self) -> String {
        self.host().to_string()
    }
}

/// A `scheme://node:service` URL.
///
/// IPv6 nodes are rendered in brackets. Scheme and service are optional
/// when parsing so that user input like `0.0.0.0` or `[::]:1234` is
/// accepted and completed later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ServerUrl {
    scheme: String,
    node: String,
    service: String,
}

impl ServerUrl {
    /// Build a URL from its parts.
    pub fn new(
        scheme: impl Into<String>,
        node: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            node: node.into(),
            service: service.into(),
        }
    }

    /// Canonical `tcp://address:port` URL for a resolved address.
    pub fn from_ip(ip: IpAddr, port: NetworkPort) -> Self {
        Self::new(TCP_SCHEME, ip.to_string(), port.to_service())
    }

    /// Canonical URL for a socket address.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip(), NetworkPort::from_host(addr.port()))
    }

    /// URL scheme, possibly empty.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address literal, without brackets.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Port or service name, possibly empty.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Replace the scheme.
    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        self.scheme = scheme.into();
    }

    /// Replace the service.
    pub fn set_service(&mut self, service: impl Into<String>) {
        self.service = service.into();
    }

    /// Port parsed from the service part.
    pub fn port(&self) -> Result<u16> {
        NetworkPort::from_service(&self.service).map(NetworkPort::host)
    }

    /// Socket address when the node is an IP literal.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .node
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidUrl(self.to_string()))?;
        Ok(SocketAddr::new(ip, self.port()?))
    }

    /// Resolve the node through the system resolver.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        if let Ok(addr) = self.socket_addr() {
            return Ok(vec![addr]);
        }
        let port = self.port()?;
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.node.as_str(), port))
            .await?
            .collect();
        if addrs.is_empty() {
            return Err(Error::InvalidUrl(self.to_string()));
        }
        Ok(addrs)
    }
}

impl FromStr for ServerUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("", s),
        };

        let (node, service) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (node, after) = bracketed
                .split_once(']')
                .ok_or_else(|| Error::InvalidUrl(s.to_string()))?;
            let service = match after {
                "" => "",
                other => other
                    .strip_prefix(':')
                    .ok_or_else(|| Error::InvalidUrl(s.to_string()))?,
            };
            (node, service)
        } else if rest.matches(':').count() == 1 {
            rest.split_once(':').unwrap_or((rest, ""))
        } else {
            // bare IPv6 literal or plain host name
            (rest, "")
        };

        if node.is_empty() && service.is_empty() {
            return Err(Error::InvalidUrl(s.to_string()));
        }

        Ok(Self::new(scheme, node, service))
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{}://", self.scheme)?;
        }
        if self.node.contains(':') {
            write!(f, "[{}]", self.node)?;
        } else {
            f.write_str(&self.node)?;
        }
        if !self.service.is_empty() {
            write!(f, ":{}", self.service)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn network_port_round_trips_service_text() {
        let port = NetworkPort::from_service("55132").unwrap();
        assert_eq!(port.wire(), 55132u16.to_be());
        assert_eq!(port.host(), 55132);
        assert_eq!(port.to_service(), "55132");
        assert_eq!(NetworkPort::from_wire(port.wire()), port);
    }

    #[test]
    fn network_port_rejects_garbage() {
        assert!(matches!(
            NetworkPort::from_service("http"),
            Err(Error::InvalidPort(p)) if p == "http"
        ));
        assert!(NetworkPort::from_service("70000").is_err());
    }

    #[test]
    fn canonical_url_for_ipv4() {
        let url = ServerUrl::from_ip(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            NetworkPort::from_host(55132),
        );
        assert_eq!(url.to_string(), "tcp://10.0.0.5:55132");
    }

    #[test]
    fn canonical_url_brackets_ipv6() {
        let url = ServerUrl::from_socket_addr(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            1234,
        ));
        assert_eq!(url.to_string(), "tcp://[::1]:1234");
        assert_eq!(url.node(), "::1");
    }

    #[test]
    fn parses_partial_urls() {
        let url: ServerUrl = "0.0.0.0".parse().unwrap();
        assert_eq!((url.scheme(), url.node(), url.service()), ("", "0.0.0.0", ""));

        let url: ServerUrl = "[::]:99".parse().unwrap();
        assert_eq!((url.scheme(), url.node(), url.service()), ("", "::", "99"));

        let url: ServerUrl = "::".parse().unwrap();
        assert_eq!(url.node(), "::");

        let url: ServerUrl = "tcp://myhost:55132".parse().unwrap();
        assert_eq!(url.port().unwrap(), 55132);
        assert!(url.socket_addr().is_err());
    }

    #[test]
    fn rejects_unterminated_bracket() {
        assert!("tcp://[::1:80".parse::<ServerUrl>().is_err());
        assert!("tcp://[::1]x80".parse::<ServerUrl>().is_err());
        assert!("".parse::<ServerUrl>().is_err());
    }

    #[test]
    fn mask_iterates_in_fixed_order() {
        let all: Vec<_> = AddressFamilyMask::ALL.families().collect();
        assert_eq!(all, vec![AddressFamily::Ipv4, AddressFamily::Ipv6]);

        let v6: Vec<_> = AddressFamilyMask::IPV6.families().collect();
        assert_eq!(v6, vec![AddressFamily::Ipv6]);

        assert_eq!(
            AddressFamilyMask::IPV4 | AddressFamilyMask::IPV6,
            AddressFamilyMask::ALL
        );
        assert!(AddressFamilyMask::NONE.is_empty());
        assert!(!AddressFamilyMask::IPV4.contains(AddressFamily::Ipv6));
    }

    #[tokio::test]
    async fn resolve_short_circuits_ip_literals() {
        let url: ServerUrl = "tcp://127.0.0.1:80".parse().unwrap();
        let addrs = url.resolve().await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse().unwrap()]);
    }
}
