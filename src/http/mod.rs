//! HTTP-shaped message handling shared by SSDP (over UDP) and GENA (over TCP).

mod client;
mod message;

pub use client::{HttpClient, UreqClient};
pub use message::{HttpHeaders, HttpRequest, HttpResponse};

/// Resolve a possibly relative URL against a base URL.
///
/// - Absolute URLs (http:// or https://) are returned as-is.
/// - URLs starting with `/` are resolved against the scheme://host:port of
///   the base.
/// - Anything else is appended to the base authority with a separating `/`.
pub(crate) fn resolve_url(base_url: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }

    if let Some((scheme, rest)) = base_url.split_once("://") {
        let authority = match rest.find('/') {
            Some(pos) => &rest[..pos],
            None => rest,
        };
        let base = format!("{}://{}", scheme, authority);

        if url.starts_with('/') {
            return format!("{}{}", base, url);
        }
        return format!("{}/{}", base, url);
    }

    // Cannot parse the base, hand back the raw URL.
    url.to_string()
}

/// Extract (host, port) from an http(s) URL. IPv6 hosts are returned without
/// their surrounding brackets.
pub(crate) fn parse_host_port(url: &str) -> Option<(String, u16)> {
    let default_port = if url.to_ascii_lowercase().starts_with("https://") {
        443
    } else {
        80
    };
    let (_, rest) = url.split_once("://")?;
    let mut parts = rest.splitn(2, '/');
    let authority = parts.next()?.trim();
    if authority.starts_with('[') {
        let end = authority.find(']')?;
        let host = &authority[1..end];
        let remainder = authority.get(end + 1..).unwrap_or("");
        let port = if let Some(stripped) = remainder.strip_prefix(':') {
            stripped.parse().unwrap_or(default_port)
        } else {
            default_port
        };
        Some((host.to_string(), port))
    } else if let Some((host, port)) = authority.split_once(':') {
        Some((host.to_string(), port.parse().ok()?))
    } else {
        Some((authority.to_string(), default_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_url_absolute_passthrough() {
        assert_eq!(
            resolve_url("http://192.0.2.2:12345/device.xml", "http://192.0.2.3/scpd.xml"),
            "http://192.0.2.3/scpd.xml"
        );
    }

    #[test]
    fn resolve_url_rooted_path() {
        assert_eq!(
            resolve_url("http://192.0.2.2:12345/device.xml", "/cds.xml"),
            "http://192.0.2.2:12345/cds.xml"
        );
    }

    #[test]
    fn resolve_url_relative_path() {
        assert_eq!(
            resolve_url("http://192.0.2.2:12345/device.xml", "cds.xml"),
            "http://192.0.2.2:12345/cds.xml"
        );
    }

    #[test]
    fn parse_host_port_variants() {
        assert_eq!(
            parse_host_port("http://192.0.2.2:12345/device.xml"),
            Some(("192.0.2.2".to_string(), 12345))
        );
        assert_eq!(
            parse_host_port("http://192.0.2.2/device.xml"),
            Some(("192.0.2.2".to_string(), 80))
        );
        assert_eq!(
            parse_host_port("http://[fe80::1]:8080/x"),
            Some(("fe80::1".to_string(), 8080))
        );
    }
}
