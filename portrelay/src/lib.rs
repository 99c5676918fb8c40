//! Reconfigurable tcp/udp port forwarding.
//!
//! A [`route::RouteTable`] declares named listen -> forward mappings; the
//! [`orchestrator::LifecycleOrchestrator`] keeps one running listener per enabled route
//! and restarts listeners whenever the table changes.

pub mod config;
pub mod control;
pub mod error;
pub mod ipc;
pub mod listener;
pub mod logging;
pub mod orchestrator;
pub mod relay;
pub mod route;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use error::{RelayError, RelayResult};
pub use orchestrator::LifecycleOrchestrator;
