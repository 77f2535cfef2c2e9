//! HTTP client collaborator contract and its default `ureq` implementation.

use std::io::Read;
use std::time::Duration;

use ureq::{http, Agent};

use crate::errors::ControlPointError;
use crate::http::{HttpRequest, HttpResponse};

const HTTP_TIMEOUT_SECS: u64 = 10;

/// Synchronous HTTP collaborator used for description downloads, SCPD and
/// icon fetches, and the GENA SUBSCRIBE/UNSUBSCRIBE verbs.
///
/// Tests substitute this with canned-response implementations.
pub trait HttpClient: Send + Sync {
    /// Execute an arbitrary request (including non-standard verbs such as
    /// SUBSCRIBE) and return the raw response.
    fn post(&self, request: &HttpRequest) -> Result<HttpResponse, ControlPointError>;

    /// GET a URL and return its body as text.
    fn download_string(&self, url: &str) -> Result<String, ControlPointError>;

    /// GET a URL and return its body as bytes.
    fn download_binary(&self, url: &str) -> Result<Vec<u8>, ControlPointError>;
}

/// Default [`HttpClient`] backed by a `ureq` agent.
pub struct UreqClient {
    agent: Agent,
}

impl UreqClient {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        // Non-standard methods are required for SUBSCRIBE/UNSUBSCRIBE, and
        // non-2xx statuses must surface as responses, not transport errors.
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .allow_non_standard_methods(true)
            .build()
            .into();
        Self { agent }
    }

    fn read_response(
        response: http::Response<ureq::Body>,
    ) -> Result<HttpResponse, ControlPointError> {
        let status = response.status().as_u16();
        let reason = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let mut out = HttpResponse::new(status, &reason);
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                out.headers.set(name.as_str(), value);
            }
        }
        let (_parts, body) = response.into_parts();
        let mut reader = body.into_reader();
        reader
            .read_to_end(&mut out.body)
            .map_err(ControlPointError::network)?;
        Ok(out)
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for UreqClient {
    fn post(&self, request: &HttpRequest) -> Result<HttpResponse, ControlPointError> {
        let mut builder = http::Request::builder()
            .method(request.method.as_str())
            .uri(&request.uri);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let req = builder
            .body(request.body.clone())
            .map_err(ControlPointError::network)?;
        let response = self.agent.run(req).map_err(ControlPointError::network)?;
        Self::read_response(response)
    }

    fn download_string(&self, url: &str) -> Result<String, ControlPointError> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(ControlPointError::network)?;
        if !response.status().is_success() {
            return Err(ControlPointError::Network(format!(
                "GET {} returned HTTP {}",
                url,
                response.status()
            )));
        }
        let (_parts, body) = response.into_parts();
        let mut text = String::new();
        body.into_reader()
            .read_to_string(&mut text)
            .map_err(ControlPointError::network)?;
        Ok(text)
    }

    fn download_binary(&self, url: &str) -> Result<Vec<u8>, ControlPointError> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(ControlPointError::network)?;
        if !response.status().is_success() {
            return Err(ControlPointError::Network(format!(
                "GET {} returned HTTP {}",
                url,
                response.status()
            )));
        }
        let (_parts, body) = response.into_parts();
        let mut bytes = Vec::new();
        body.into_reader()
            .read_to_end(&mut bytes)
            .map_err(ControlPointError::network)?;
        Ok(bytes)
    }
}
