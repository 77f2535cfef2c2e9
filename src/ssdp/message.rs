//! Typed view over an SSDP packet.
//!
//! SSDP messages are HTTP-shaped datagrams. This wrapper keeps the parsed
//! message together with the receive context (source address and the local
//! interface address the packet arrived on) and derives the fields the
//! control point routes on: UUID, NT/ST, NTS, LOCATION and max-age.

use std::net::{IpAddr, SocketAddr};

use crate::errors::ControlPointError;
use crate::http::{parse_host_port, HttpRequest, HttpResponse};
use crate::ssdp::{DEFAULT_MAX_AGE, SSDP_MCAST_V4, SSDP_MCAST_V6, SSDP_PORT};

/// Notification sub-type of a NOTIFY message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nts {
    Alive,
    ByeBye,
    Update,
    Unknown,
}

impl Nts {
    fn parse(value: Option<&str>) -> Nts {
        match value.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("ssdp:alive") => Nts::Alive,
            Some("ssdp:byebye") => Nts::ByeBye,
            Some("ssdp:update") => Nts::Update,
            _ => Nts::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Request(HttpRequest),
    Response(HttpResponse),
}

/// A parsed SSDP packet plus its receive context.
#[derive(Debug, Clone)]
pub struct SsdpMessage {
    payload: Payload,
    source: Option<SocketAddr>,
    local_address: Option<IpAddr>,
    uuid: String,
}

impl SsdpMessage {
    /// Parse a received datagram. `source` is the peer address of the
    /// datagram, `local_address` the address of the interface the socket is
    /// bound to.
    pub fn parse(
        data: &[u8],
        source: SocketAddr,
        local_address: IpAddr,
    ) -> Result<Self, ControlPointError> {
        let payload = if data.starts_with(b"HTTP/") {
            Payload::Response(HttpResponse::parse(data)?)
        } else {
            Payload::Request(HttpRequest::parse(data)?)
        };
        let mut message = Self {
            payload,
            source: Some(source),
            local_address: Some(local_address),
            uuid: String::new(),
        };
        message.uuid = extract_uuid(message.header("USN").unwrap_or(""));
        Ok(message)
    }

    /// Build an M-SEARCH request for the given search target.
    pub fn search_request(st: &str, mx: u32, ipv6: bool) -> Self {
        let host = if ipv6 {
            format!("[{}]:{}", SSDP_MCAST_V6, SSDP_PORT)
        } else {
            format!("{}:{}", SSDP_MCAST_V4, SSDP_PORT)
        };
        let mut request = HttpRequest::new("M-SEARCH", "*");
        request.headers.set("HOST", &host);
        request.headers.set("MAN", "\"ssdp:discover\"");
        request.headers.set("MX", &mx.max(1).to_string());
        request.headers.set("ST", st);
        Self {
            payload: Payload::Request(request),
            source: None,
            local_address: None,
            uuid: String::new(),
        }
    }

    /// Request method, `None` for responses.
    pub fn method(&self) -> Option<&str> {
        match &self.payload {
            Payload::Request(r) => Some(r.method.as_str()),
            Payload::Response(_) => None,
        }
    }

    /// True for `HTTP/1.1 200 ...` search responses.
    pub fn is_response(&self) -> bool {
        matches!(&self.payload, Payload::Response(_))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        match &self.payload {
            Payload::Request(r) => r.headers.get(name),
            Payload::Response(r) => r.headers.get(name),
        }
    }

    /// UUID extracted from the USN header; empty when absent.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn usn(&self) -> Option<&str> {
        self.header("USN")
    }

    /// NT for NOTIFY, ST for search messages and responses.
    pub fn notification_type(&self) -> Option<&str> {
        self.header("NT").or_else(|| self.header("ST"))
    }

    pub fn nts(&self) -> Nts {
        Nts::parse(self.header("NTS"))
    }

    pub fn location(&self) -> Option<&str> {
        self.header("LOCATION")
    }

    /// max-age from CACHE-CONTROL, defaulting when missing or malformed.
    pub fn max_age(&self) -> u32 {
        parse_max_age(self.header("CACHE-CONTROL"))
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    /// Address of the interface the packet was received on.
    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    /// True when the LOCATION host matches the datagram source address.
    ///
    /// Byebye carries no LOCATION and is exempt from this check.
    pub fn has_valid_location(&self) -> bool {
        let Some(source) = self.source else {
            return false;
        };
        let Some(location) = self.location() else {
            return false;
        };
        let Some((host, _port)) = parse_host_port(location) else {
            return false;
        };
        match host.parse::<IpAddr>() {
            Ok(ip) => ip == source.ip(),
            // Hostname LOCATIONs cannot be validated against the source
            // address without a resolver round trip; reject them.
            Err(_) => false,
        }
    }

    /// Message body (empty for ordinary SSDP, used by multicast eventing).
    pub fn body(&self) -> &[u8] {
        match &self.payload {
            Payload::Request(r) => &r.body,
            Payload::Response(r) => &r.body,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match &self.payload {
            Payload::Request(r) => r.serialize(),
            Payload::Response(r) => r.serialize(),
        }
    }
}

/// Pull the `uuid:...` prefix out of a USN value.
fn extract_uuid(usn: &str) -> String {
    let trimmed = usn.trim();
    let lower = trimmed.to_ascii_lowercase();
    let Some(idx) = lower.find("uuid:") else {
        return String::new();
    };
    let sub = &trimmed[idx..];
    match sub.find("::") {
        Some(end) => sub[..end].to_string(),
        None => sub.to_string(),
    }
}

fn parse_max_age(value: Option<&str>) -> u32 {
    if let Some(v) = value {
        let lower = v.to_ascii_lowercase();
        if let Some(idx) = lower.find("max-age") {
            let after_key = &v[idx + 7..];
            let after_eq = after_key.trim_start().trim_start_matches('=').trim_start();
            let digits: String = after_eq
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(age) = digits.parse::<u32>() {
                return age;
            }
        }
    }
    DEFAULT_MAX_AGE
}
