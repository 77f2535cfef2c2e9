use thiserror::Error;

/// Errors surfaced by the control point and its subsystems.
#[derive(Error, Debug)]
pub enum ControlPointError {
    /// Socket bind/send/receive failure, HTTP transport failure or non-2xx
    /// response where a 200 was required.
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed HTTP/SSDP message or a missing required header.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device or service description could not be parsed into a usable graph.
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Operation invoked in a lifecycle state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// UDN or SID lookup miss where the caller required existence.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl ControlPointError {
    pub fn network(err: impl std::fmt::Display) -> Self {
        ControlPointError::Network(err.to_string())
    }

    pub fn protocol(message: &str) -> Self {
        ControlPointError::Protocol(message.to_string())
    }

    pub fn invalid_description(err: impl std::fmt::Display) -> Self {
        ControlPointError::InvalidDescription(err.to_string())
    }
}

impl From<std::io::Error> for ControlPointError {
    fn from(err: std::io::Error) -> Self {
        ControlPointError::Network(err.to_string())
    }
}

impl From<xmltree::ParseError> for ControlPointError {
    fn from(err: xmltree::ParseError) -> Self {
        ControlPointError::InvalidDescription(err.to_string())
    }
}
