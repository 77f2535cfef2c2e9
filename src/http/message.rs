//! Minimal HTTP message codec.
//!
//! SSDP datagrams and GENA requests are HTTP-1.1-shaped: a start line, ASCII
//! headers terminated by CRLF CRLF, and an optional body. This module parses
//! and serializes both directions without pulling in a full HTTP stack.

use std::io::{self, BufRead, Write};

use crate::errors::ControlPointError;

const CRLF: &str = "\r\n";

/// An ordered header bag with case-insensitive lookup.
///
/// Insertion order is preserved so a parse/serialize round trip keeps the
/// original header sequence.
#[derive(Debug, Clone, Default)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace the value of `name`, or append if absent.
    pub fn set(&mut self, name: &str, value: &str) {
        for (n, v) in &mut self.entries {
            if n.eq_ignore_ascii_case(name) {
                *v = value.to_string();
                return;
            }
        }
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn parse_line(&mut self, line: &str) {
        // Split on the first ':' only, values may contain ':'.
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if !name.is_empty() {
                self.entries.push((name.to_string(), value.trim().to_string()));
            }
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(CRLF.as_bytes());
        }
        out.extend_from_slice(CRLF.as_bytes());
    }
}

/// An HTTP request: `METHOD uri HTTP/1.1` plus headers and body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: HttpHeaders::new(),
            body: Vec::new(),
        }
    }

    /// Parse a complete request held in a byte buffer (the SSDP datagram
    /// case). The body is whatever follows the blank line.
    pub fn parse(data: &[u8]) -> Result<Self, ControlPointError> {
        let (head, body) = split_head(data);
        let text = std::str::from_utf8(head)
            .map_err(|_| ControlPointError::protocol("request is not valid UTF-8"))?;
        let mut lines = text.lines();
        let start = lines
            .next()
            .ok_or_else(|| ControlPointError::protocol("missing request line"))?;
        let mut parts = start.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| ControlPointError::protocol("missing method"))?
            .to_string();
        let uri = parts
            .next()
            .ok_or_else(|| ControlPointError::protocol("missing request URI"))?
            .to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();

        let mut headers = HttpHeaders::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            headers.parse_line(line);
        }

        Ok(Self {
            method,
            uri,
            version,
            headers,
            body: body.to_vec(),
        })
    }

    /// Read one request from a stream: request line, headers, then exactly
    /// Content-Length body bytes.
    pub fn read_from<R: BufRead>(reader: &mut R) -> io::Result<Self> {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "missing request line",
            ));
        }

        let request_line = request_line.trim_end_matches(['\r', '\n']);
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing method"))?
            .to_ascii_uppercase();
        let uri = parts
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing path"))?
            .to_string();
        let version = parts.next().unwrap_or("HTTP/1.1").to_string();

        let mut headers = HttpHeaders::new();
        loop {
            let mut line = String::new();
            let len = reader.read_line(&mut line)?;
            if len == 0 {
                break;
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            headers.parse_line(trimmed);
        }

        let content_length: usize = headers
            .get("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;

        Ok(Self {
            method,
            uri,
            version,
            headers,
            body,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}{}", self.method, self.uri, self.version, CRLF).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(&self.body);
        out
    }
}

/// An HTTP response: `HTTP/1.1 status reason` plus headers and body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            headers: HttpHeaders::new(),
            body: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ControlPointError> {
        let (head, body) = split_head(data);
        let text = std::str::from_utf8(head)
            .map_err(|_| ControlPointError::protocol("response is not valid UTF-8"))?;
        let mut lines = text.lines();
        let start = lines
            .next()
            .ok_or_else(|| ControlPointError::protocol("missing status line"))?;
        let mut parts = start.split_whitespace();
        let version = parts
            .next()
            .filter(|v| v.to_ascii_uppercase().starts_with("HTTP/"))
            .ok_or_else(|| ControlPointError::protocol("missing HTTP version"))?
            .to_string();
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ControlPointError::protocol("missing status code"))?;
        let reason = parts.collect::<Vec<_>>().join(" ");

        let mut headers = HttpHeaders::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            headers.parse_line(line);
        }

        Ok(Self {
            version,
            status,
            reason,
            headers,
            body: body.to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {}{}", self.version, self.status, self.reason, CRLF).as_bytes(),
        );
        self.headers.write_to(&mut out);
        out.extend_from_slice(&self.body);
        out
    }

    /// Write a body-less status response to a stream (GENA callback replies).
    pub fn write_empty<W: Write>(stream: &mut W, status: u16, reason: &str) -> io::Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status, reason
        );
        stream.write_all(response.as_bytes())
    }
}

/// Split a buffer at the header/body boundary (CRLF CRLF, with a bare LF LF
/// fallback for sloppy senders).
fn split_head(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find_subsequence(data, b"\r\n\r\n") {
        (&data[..pos], &data[pos + 4..])
    } else if let Some(pos) = find_subsequence(data, b"\n\n") {
        (&data[..pos], &data[pos + 2..])
    } else {
        (data, &[])
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
