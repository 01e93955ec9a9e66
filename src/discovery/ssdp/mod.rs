//! SSDP discovery backend.
//!
//! The server side runs one responder task per usable address family:
//! it answers matching `M-SEARCH` requests and multicasts `ssdp:alive`
//! periodically. The client side multicasts an `M-SEARCH` per requested
//! family and collects replies for the search window. The reply's source
//! address becomes the URL node, so URLs never carry host names.

pub mod message;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use self::message::{usn_for, uuid_from_usn, NotifySubtype, SsdpMessage, SSDP_ALL};
use super::{local_host_name, DiscoveryBackend, PeerUrls};
use crate::config::DiscoveryConfig;
use crate::url::{AddressFamily, AddressFamilyMask, NetworkPort, ServerUrl, TCP_SCHEME};

/// Search target shared by every server and client.
pub const SEARCH_TARGET: &str = "urn:schemas-hal-remote:service:halRemote:1";

/// SSDP UDP port.
pub const SSDP_PORT: u16 = 1900;

/// IPv4 SSDP multicast group.
pub const SSDP_GROUP_V4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// IPv6 link-local SSDP multicast group.
pub const SSDP_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);

const MAX_DATAGRAM: usize = 2048;

/// Multicast destination for `family`.
pub fn group_addr(family: AddressFamily) -> SocketAddr {
    match family {
        AddressFamily::Ipv4 => SocketAddr::new(IpAddr::V4(SSDP_GROUP_V4), SSDP_PORT),
        AddressFamily::Ipv6 => SocketAddr::new(IpAddr::V6(SSDP_GROUP_V6), SSDP_PORT),
    }
}

fn host_header(family: AddressFamily) -> String {
    match family {
        AddressFamily::Ipv4 => format!("{SSDP_GROUP_V4}:{SSDP_PORT}"),
        AddressFamily::Ipv6 => format!("[{SSDP_GROUP_V6}]:{SSDP_PORT}"),
    }
}

/// What this process advertises.
#[derive(Debug, Clone)]
struct Advert {
    usn: String,
    location: String,
}

impl Advert {
    fn alive(&self) -> SsdpMessage {
        SsdpMessage::Notify {
            notification_type: SEARCH_TARGET.to_string(),
            usn: self.usn.clone(),
            subtype: NotifySubtype::Alive {
                location: self.location.clone(),
            },
        }
    }

    fn byebye(&self) -> SsdpMessage {
        SsdpMessage::Notify {
            notification_type: SEARCH_TARGET.to_string(),
            usn: self.usn.clone(),
            subtype: NotifySubtype::ByeBye,
        }
    }

    fn response(&self) -> SsdpMessage {
        SsdpMessage::Response {
            search_target: SEARCH_TARGET.to_string(),
            usn: self.usn.clone(),
            location: self.location.clone(),
        }
    }
}

/// SSDP discovery backend.
pub struct SsdpBackend {
    search_window: Duration,
    notify_interval: Duration,
    advert: Option<Advert>,
    responders: Vec<(AddressFamily, JoinHandle<()>)>,
}

impl SsdpBackend {
    /// Create a backend using the discovery settings.
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            search_window: config.search_window,
            notify_interval: config.notify_interval,
            advert: None,
            responders: Vec::new(),
        }
    }

    /// Whether any responder is running.
    pub fn is_advertising(&self) -> bool {
        !self.responders.is_empty()
    }

    fn abort_responders(&mut self) {
        for (family, handle) in self.responders.drain(..) {
            debug!(family = %family, "Stopping SSDP responder");
            handle.abort();
        }
    }

    async fn search(&self, family: AddressFamily) -> std::io::Result<Vec<(SocketAddr, String)>> {
        let bind: SocketAddr = match family {
            AddressFamily::Ipv4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
            AddressFamily::Ipv6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        let request = SsdpMessage::Search {
            search_target: SEARCH_TARGET.to_string(),
            max_wait: self.search_window.as_secs().max(1) as u32,
        }
        .render(&host_header(family));
        socket.send_to(request.as_bytes(), group_addr(family)).await?;

        let deadline = Instant::now() + self.search_window;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut replies = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!(family = %family, error = %e, "SSDP receive failed");
                    break;
                }
                Ok(Ok((len, from))) => {
                    replies.push((from, String::from_utf8_lossy(&buf[..len]).into_owned()));
                }
            }
        }
        Ok(replies)
    }
}

/// Turn one search reply into `(uuid, url)`, or `None` when it is not ours.
fn parse_reply(from: SocketAddr, datagram: &str) -> Option<(String, ServerUrl)> {
    let (search_target, usn, location) = match SsdpMessage::parse(datagram) {
        Ok(SsdpMessage::Response {
            search_target,
            usn,
            location,
        }) => (search_target, usn, location),
        Ok(other) => {
            trace!(from = %from, message = ?other, "Ignoring SSDP message");
            return None;
        }
        Err(e) => {
            warn!(from = %from, error = %e, "Malformed SSDP reply");
            return None;
        }
    };
    if search_target != SEARCH_TARGET {
        trace!(from = %from, st = %search_target, "Ignoring foreign SSDP reply");
        return None;
    }
    let Some(uuid) = uuid_from_usn(&usn) else {
        error!(from = %from, usn = %usn, "SSDP reply missing uuid");
        return None;
    };
    let port = match location.parse::<ServerUrl>().and_then(|url| url.port()) {
        Ok(port) => port,
        Err(e) => {
            warn!(from = %from, location = %location, error = %e, "SSDP reply with bad location");
            return None;
        }
    };
    let url = ServerUrl::from_ip(from.ip(), NetworkPort::from_host(port));
    Some((uuid.to_string(), url))
}

fn multicast_listener(family: AddressFamily) -> std::io::Result<UdpSocket> {
    let socket = match family {
        AddressFamily::Ipv4 => {
            let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_reuse_address(true)?;
            #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
            socket.set_reuse_port(true)?;
            let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, SSDP_PORT).into();
            socket.bind(&addr.into())?;
            socket.join_multicast_v4(&SSDP_GROUP_V4, &Ipv4Addr::UNSPECIFIED)?;
            socket
        }
        AddressFamily::Ipv6 => {
            let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
            socket.set_only_v6(true)?;
            socket.set_reuse_address(true)?;
            #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
            socket.set_reuse_port(true)?;
            let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, SSDP_PORT).into();
            socket.bind(&addr.into())?;
            socket.join_multicast_v6(&SSDP_GROUP_V6, 0)?;
            socket
        }
    };
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn run_responder(
    socket: UdpSocket,
    family: AddressFamily,
    advert: Advert,
    notify_interval: Duration,
) {
    let host = host_header(family);
    let alive = advert.alive().render(&host);
    let response = advert.response().render("");
    let mut buf = vec![0u8; MAX_DATAGRAM];

    let mut interval = tokio::time::interval(notify_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = socket.send_to(alive.as_bytes(), group_addr(family)).await {
                    warn!(family = %family, error = %e, "SSDP notify failed");
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(family = %family, error = %e, "SSDP responder receive failed");
                        continue;
                    }
                };
                let text = String::from_utf8_lossy(&buf[..len]);
                match SsdpMessage::parse(&text) {
                    Ok(SsdpMessage::Search { search_target, .. })
                        if search_target == SEARCH_TARGET || search_target == SSDP_ALL =>
                    {
                        debug!(from = %from, "Answering SSDP search");
                        if let Err(e) = socket.send_to(response.as_bytes(), from).await {
                            warn!(from = %from, error = %e, "SSDP response failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => trace!(from = %from, error = %e, "Ignoring SSDP datagram"),
                }
            }
        }
    }
}

async fn send_byebye(advert: &Advert, family: AddressFamily) -> std::io::Result<()> {
    let bind: SocketAddr = match family {
        AddressFamily::Ipv4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
        AddressFamily::Ipv6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    let text = advert.byebye().render(&host_header(family));
    socket.send_to(text.as_bytes(), group_addr(family)).await?;
    Ok(())
}

#[async_trait]
impl DiscoveryBackend for SsdpBackend {
    fn name(&self) -> &'static str {
        "ssdp"
    }

    async fn advertise(&mut self, uuid: &str, service: &str) {
        let port = match NetworkPort::from_service(service) {
            Ok(port) => port,
            Err(e) => {
                error!(service, error = %e, "SSDP advertise with bad port");
                return;
            }
        };

        self.teardown().await;

        let location = ServerUrl::new(TCP_SCHEME, local_host_name(), port.to_service());
        let advert = Advert {
            usn: usn_for(uuid, SEARCH_TARGET),
            location: location.to_string(),
        };

        for family in AddressFamily::ALL {
            match multicast_listener(family) {
                Ok(socket) => {
                    let handle = tokio::spawn(run_responder(
                        socket,
                        family,
                        advert.clone(),
                        self.notify_interval,
                    ));
                    self.responders.push((family, handle));
                }
                Err(e) => warn!(family = %family, error = %e, "SSDP responder unavailable"),
            }
        }

        if self.responders.is_empty() {
            error!("SSDP advertisement failed on every address family");
            return;
        }
        info!(usn = %advert.usn, location = %advert.location, "SSDP advertising");
        self.advert = Some(advert);
    }

    async fn resolve_all(&self, mask: AddressFamilyMask) -> PeerUrls {
        let mut result = PeerUrls::new();
        for family in mask.families() {
            let replies = match self.search(family).await {
                Ok(replies) => replies,
                Err(e) => {
                    warn!(family = %family, error = %e, "SSDP search failed");
                    continue;
                }
            };
            for (from, datagram) in replies {
                if !family.matches(&from.ip()) {
                    continue;
                }
                if let Some((uuid, url)) = parse_reply(from, &datagram) {
                    debug!(url = %url, uuid = %uuid, family = %family, "SSDP discovered");
                    result.entry(uuid).or_default().insert(family, url);
                }
            }
        }
        result
    }

    async fn teardown(&mut self) {
        let families: Vec<AddressFamily> =
            self.responders.iter().map(|(family, _)| *family).collect();
        self.abort_responders();
        if let Some(advert) = self.advert.take() {
            for family in families {
                if let Err(e) = send_byebye(&advert, family).await {
                    debug!(family = %family, error = %e, "SSDP byebye failed");
                }
            }
        }
    }
}

impl Drop for SsdpBackend {
    fn drop(&mut self) {
        self.abort_responders();
    }
}
