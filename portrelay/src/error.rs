//! Error taxonomy shared by the route table, the relays and the control plane.

use crate::route::{Endpoint, Protocol};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Route already exists: {0}")]
    DuplicateName(String),

    #[error("Route not found: {0}")]
    NotFound(String),

    /// Another running route already holds the same (protocol, host, port).
    #[error("{protocol} address {address} is already in use by route '{holder}'")]
    AddressInUse { protocol: Protocol, address: Endpoint, holder: String },

    #[error("Failed to bind {protocol} listener on {address}: {source}")]
    Bind {
        protocol: Protocol,
        address: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to reach backend {address}: {source}")]
    Dial {
        address: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("Transient I/O error while {context}: {source}")]
    TransientIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist routes: {0}")]
    Persistence(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),
}

impl RelayError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRequest(message.into())
    }

    /// HTTP status used by the control plane when this error is surfaced to a caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::DuplicateName(_) | Self::AddressInUse { .. } => 409,
            Self::MalformedRequest(_) => 400,
            _ => 500,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
