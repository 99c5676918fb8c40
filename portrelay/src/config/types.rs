use crate::route::{Route, RouteDefinition};
use crate::utils::path::with_json_extension;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "./portrelay.json";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub(crate) path: PathBuf,
    // Idle time after which a udp session is evicted, shared by every udp route
    #[serde(deserialize_with = "idle_timeout_or_default", default = "default_idle_timeout")]
    pub(crate) session_idle_timeout_secs: u64,
    // Where the control API listens
    #[serde(default)]
    pub(crate) control: ControlConfig,
    #[serde(default)]
    pub(crate) logging: LoggingConfig,
    // Declared routes, in table order
    #[serde(deserialize_with = "routes_or_skip", default)]
    pub(crate) routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(deserialize_with = "string_or_default", default = "default_control_host")]
    pub host: String,
    #[serde(deserialize_with = "u16_or_default", default = "default_control_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(deserialize_with = "bool_or_true", default = "default_true")]
    pub enabled: bool,
    // Minimum level: error, warn, info, debug or trace
    #[serde(deserialize_with = "string_or_default", default = "default_log_level")]
    pub level: String,
    // When set, log lines are also written to a per-day file in this directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_PATH)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { host: default_control_host(), port: default_control_port() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enabled: true, level: default_log_level(), directory: None }
    }
}

impl Config {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: with_json_extension(path),
            session_idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
            routes: Vec::new(),
        }
    }

    pub fn get_path(&self) -> &PathBuf {
        &self.path
    }

    pub fn get_routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn set_routes(&mut self, routes: Vec<Route>) {
        self.routes = routes;
    }

    pub fn get_control(&self) -> &ControlConfig {
        &self.control
    }

    pub fn get_logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn set_session_idle_timeout_secs(&mut self, secs: u64) {
        self.session_idle_timeout_secs = secs;
    }

    /// Process-wide udp session idle timeout, never shorter than one second.
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs.max(1))
    }
}

impl ControlConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        let ip = host.parse().map_err(|e| anyhow::anyhow!("Invalid control host '{}': {}", self.host, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| std::fmt::Error)?;
        writeln!(f, "{}", json)
    }
}

// Helper functions for deserialization
fn string_or_default<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match String::deserialize(deserializer) {
        Ok(s) => Ok(s),
        Err(e) => {
            warn!("Failed to deserialize string value: {}, using default", e);
            Ok(String::default())
        }
    }
}

// Forgiving bool: non-bool types fall back to true.
fn bool_or_true<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match bool::deserialize(deserializer) {
        Ok(b) => Ok(b),
        Err(e) => {
            warn!("Failed to deserialize bool value: {}, using true", e);
            Ok(true)
        }
    }
}

// Forgiving u16: non-integer or out-of-range types fall back to the default control port.
fn u16_or_default<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    match u16::deserialize(deserializer) {
        Ok(n) if n != 0 => Ok(n),
        Ok(_) => {
            warn!("Port 0 is not allowed, using default");
            Ok(default_control_port())
        }
        Err(e) => {
            warn!("Failed to deserialize u16 value: {}, using default", e);
            Ok(default_control_port())
        }
    }
}

fn idle_timeout_or_default<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match u64::deserialize(deserializer) {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => {
            warn!("Session idle timeout must be at least 1 second, using default");
            Ok(DEFAULT_IDLE_TIMEOUT_SECS)
        }
        Err(e) => {
            warn!("Failed to deserialize idle timeout: {}, using default", e);
            Ok(DEFAULT_IDLE_TIMEOUT_SECS)
        }
    }
}

// Invalid route entries are skipped with a warning instead of rejecting the whole file.
fn routes_or_skip<'de, D>(deserializer: D) -> std::result::Result<Vec<Route>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = match Vec::<serde_json::Value>::deserialize(deserializer) {
        Ok(values) => values,
        Err(e) => {
            warn!("Failed to deserialize routes: {}, using an empty route table", e);
            return Ok(Vec::new());
        }
    };
    let mut routes = Vec::with_capacity(values.len());
    for value in values {
        let parsed = serde_json::from_value::<RouteDefinition>(value)
            .map_err(|e| e.to_string())
            .and_then(|def| Route::try_from(def).map_err(|e| e.to_string()));
        match parsed {
            Ok(route) => routes.push(route),
            Err(e) => warn!("Skipping invalid route entry: {}", e),
        }
    }
    Ok(routes)
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_control_host() -> String {
    "127.0.0.1".to_string()
}

fn default_control_port() -> u16 {
    8686
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
