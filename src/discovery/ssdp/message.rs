//! SSDP datagram parsing and rendering.
//!
//! SSDP messages are HTTP-over-UDP: a start line, `NAME: value` headers
//! with case-insensitive names, and an empty body.

use std::fmt::Write as _;

use crate::error::{Error, Result};

/// Search target matching every SSDP resource.
pub const SSDP_ALL: &str = "ssdp:all";

/// Notification subtype of a `NOTIFY` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifySubtype {
    /// The resource is active at this location.
    Alive {
        /// Location URL.
        location: String,
    },
    /// The resource is going away.
    ByeBye,
}

/// A parsed SSDP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsdpMessage {
    /// `M-SEARCH` request.
    Search {
        /// Search target (`ST`).
        search_target: String,
        /// Maximum response delay in seconds (`MX`).
        max_wait: u32,
    },
    /// Unicast `200 OK` reply to a search.
    Response {
        /// Search target (`ST`) being answered.
        search_target: String,
        /// Unique service name (`USN`).
        usn: String,
        /// Location URL.
        location: String,
    },
    /// Multicast `NOTIFY`.
    Notify {
        /// Notification type (`NT`).
        notification_type: String,
        /// Unique service name (`USN`).
        usn: String,
        /// Alive or byebye.
        subtype: NotifySubtype,
    },
}

impl SsdpMessage {
    /// Parse a datagram.
    pub fn parse(datagram: &str) -> Result<Self> {
        let mut lines = datagram.split("\r\n").flat_map(|line| line.split('\n'));
        let start = lines
            .next()
            .map(str::trim)
            .ok_or_else(|| Error::protocol("empty SSDP datagram"))?;

        let headers: Vec<(String, &str)> = lines
            .map(str::trim)
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_uppercase(), value.trim()))
            .collect();
        let header = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.to_string())
        };
        let require = |name: &str| {
            header(name).ok_or_else(|| Error::protocol(format!("SSDP message missing {name}")))
        };

        let upper = start.to_ascii_uppercase();
        if upper.starts_with("M-SEARCH ") {
            let max_wait = header("MX").and_then(|mx| mx.parse().ok()).unwrap_or(1);
            Ok(SsdpMessage::Search {
                search_target: require("ST")?,
                max_wait,
            })
        } else if upper.starts_with("HTTP/1.1 200") {
            Ok(SsdpMessage::Response {
                search_target: require("ST")?,
                usn: require("USN")?,
                location: require("LOCATION")?,
            })
        } else if upper.starts_with("NOTIFY ") {
            let subtype = match require("NTS")?.as_str() {
                "ssdp:alive" => NotifySubtype::Alive {
                    location: require("LOCATION")?,
                },
                "ssdp:byebye" => NotifySubtype::ByeBye,
                other => return Err(Error::protocol(format!("unknown NTS '{other}'"))),
            };
            Ok(SsdpMessage::Notify {
                notification_type: require("NT")?,
                usn: require("USN")?,
                subtype,
            })
        } else {
            Err(Error::protocol(format!("unknown SSDP start line '{start}'")))
        }
    }

    /// Render the message; `host` is the multicast `HOST` header value.
    pub fn render(&self, host: &str) -> String {
        let mut out = String::new();
        match self {
            SsdpMessage::Search {
                search_target,
                max_wait,
            } => {
                out.push_str("M-SEARCH * HTTP/1.1\r\n");
                let _ = write!(out, "HOST: {host}\r\n");
                out.push_str("MAN: \"ssdp:discover\"\r\n");
                let _ = write!(out, "MX: {max_wait}\r\n");
                let _ = write!(out, "ST: {search_target}\r\n");
            }
            SsdpMessage::Response {
                search_target,
                usn,
                location,
            } => {
                out.push_str("HTTP/1.1 200 OK\r\n");
                out.push_str("CACHE-CONTROL: max-age=120\r\n");
                out.push_str("EXT:\r\n");
                let _ = write!(out, "LOCATION: {location}\r\n");
                let _ = write!(out, "ST: {search_target}\r\n");
                let _ = write!(out, "USN: {usn}\r\n");
            }
            SsdpMessage::Notify {
                notification_type,
                usn,
                subtype,
            } => {
                out.push_str("NOTIFY * HTTP/1.1\r\n");
                let _ = write!(out, "HOST: {host}\r\n");
                match subtype {
                    NotifySubtype::Alive { location } => {
                        out.push_str("CACHE-CONTROL: max-age=120\r\n");
                        let _ = write!(out, "LOCATION: {location}\r\n");
                        out.push_str("NTS: ssdp:alive\r\n");
                    }
                    NotifySubtype::ByeBye => out.push_str("NTS: ssdp:byebye\r\n"),
                }
                let _ = write!(out, "NT: {notification_type}\r\n");
                let _ = write!(out, "USN: {usn}\r\n");
            }
        }
        out.push_str("\r\n");
        out
    }
}

/// Unique service name for `uuid` offering `search_target`.
pub fn usn_for(uuid: &str, search_target: &str) -> String {
    format!("uuid:{uuid}::{search_target}")
}

/// Peer uuid carried in a USN, if any.
pub fn uuid_from_usn(usn: &str) -> Option<&str> {
    let rest = usn.strip_prefix("uuid:")?;
    let uuid = rest.split_once("::").map_or(rest, |(uuid, _)| uuid);
    (!uuid.is_empty()).then_some(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ST: &str = "urn:schemas-hal-remote:service:halRemote:1";

    #[test]
    fn parses_search_with_lowercase_headers() {
        let msg = SsdpMessage::parse(
            "M-SEARCH * HTTP/1.1\r\nhost: 239.255.255.250:1900\r\nman: \"ssdp:discover\"\r\nmx: 2\r\nst: ssdp:all\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            msg,
            SsdpMessage::Search {
                search_target: SSDP_ALL.into(),
                max_wait: 2
            }
        );
    }

    #[test]
    fn response_renders_parseable_text() {
        let response = SsdpMessage::Response {
            search_target: ST.into(),
            usn: usn_for("abc-123", ST),
            location: "tcp://bench:55132".into(),
        };
        let text = response.render("");
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(SsdpMessage::parse(&text).unwrap(), response);
    }

    #[test]
    fn notify_byebye_has_no_location() {
        let text = SsdpMessage::Notify {
            notification_type: ST.into(),
            usn: usn_for("abc-123", ST),
            subtype: NotifySubtype::ByeBye,
        }
        .render("239.255.255.250:1900");
        assert!(!text.contains("LOCATION"));
        assert!(text.contains("NTS: ssdp:byebye\r\n"));
        assert!(text.contains("HOST: 239.255.255.250:1900\r\n"));
    }

    #[test]
    fn rejects_garbage_and_incomplete_messages() {
        assert!(SsdpMessage::parse("").is_err());
        assert!(SsdpMessage::parse("GET / HTTP/1.1\r\n\r\n").is_err());
        assert!(SsdpMessage::parse("HTTP/1.1 200 OK\r\nST: x\r\n\r\n").is_err());
        assert!(SsdpMessage::parse("NOTIFY * HTTP/1.1\r\nNTS: ssdp:update\r\n\r\n").is_err());
    }

    #[test]
    fn uuid_extraction_from_usn() {
        assert_eq!(uuid_from_usn(&usn_for("abc-123", ST)), Some("abc-123"));
        assert_eq!(uuid_from_usn("uuid:solo"), Some("solo"));
        assert_eq!(uuid_from_usn("uuid:::x"), None);
        assert_eq!(uuid_from_usn("urn:something"), None);
    }
}
