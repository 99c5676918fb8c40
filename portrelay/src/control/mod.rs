// Control module
//
// - http_server: JSON API over hyper mapping requests onto the orchestrator
// - client: ControlClient, the matching hyper client used by the command line

pub mod client;
pub mod http_server;

pub use client::ControlClient;
pub use http_server::{handle_request, start_control_server};

use crate::error::RelayError;
use crate::listener::ActiveSummary;
use crate::route::RouteStatus;
use serde::{Deserialize, Serialize};

/// Outcome of a mutating control operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

impl From<&RelayError> for ControlResponse {
    fn from(e: &RelayError) -> Self {
        Self::failed(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteList {
    pub routes: Vec<RouteStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerList {
    pub listeners: Vec<ActiveSummary>,
}
