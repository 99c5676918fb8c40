use crate::error::{RelayError, RelayResult};
use crate::utils::validation::{is_empty_or_whitespace, validate_host, validate_port_range};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// Transport a route forwards over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Connection-oriented: every accepted connection is piped to its own backend connection.
    Tcp,
    /// Connectionless: datagrams are multiplexed into per-client sessions.
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("Unknown protocol '{}', expected 'tcp' or 'udp'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Host with IPv6 brackets removed, suitable for socket address resolution.
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Same port and host, ignoring ipv6 brackets and hostname case.
    pub fn same_address(&self, other: &Endpoint) -> bool {
        self.port == other.port && self.bare_host().eq_ignore_ascii_case(other.bare_host())
    }

    fn validate(&self, field: &str) -> RelayResult<()> {
        validate_host(&self.host).map_err(|e| RelayError::malformed(format!("{}: {}", field, e)))?;
        validate_port_range(self.port).map_err(|e| RelayError::malformed(format!("{}: {}", field, e)))?;
        Ok(())
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Parses `host:port`, `[v6]:port` or a bare `port` (host defaults to 0.0.0.0).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
            None => ("0.0.0.0", s),
        };
        let port = port.parse::<u16>().map_err(|_| format!("Invalid port in endpoint '{}'", s))?;
        Ok(Endpoint::new(host, port))
    }
}

/// Unvalidated route shape as it arrives from the control plane or the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub listen: Option<Endpoint>,
    #[serde(default)]
    pub forward: Option<Endpoint>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// A validated, named mapping from a listen endpoint to a forward endpoint.
///
/// Only constructible through [`Route::from_definition`] (or its `TryFrom` wrapper),
/// so a `Route` value never carries missing or malformed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RouteDefinition")]
pub struct Route {
    pub(crate) name: String,
    pub(crate) protocol: Protocol,
    pub(crate) listen: Endpoint,
    pub(crate) forward: Endpoint,
    pub(crate) enabled: bool,
}

impl Route {
    pub fn new(name: impl Into<String>, protocol: Protocol, listen: Endpoint, forward: Endpoint, enabled: bool) -> RelayResult<Self> {
        Self::from_definition(
            RouteDefinition {
                name: Some(name.into()),
                protocol: Some(protocol),
                listen: Some(listen),
                forward: Some(forward),
                enabled: Some(enabled),
            },
            None,
        )
    }

    /// Validate a definition. `name_override` replaces whatever name the definition carries,
    /// which is how updates keep the route key.
    pub fn from_definition(definition: RouteDefinition, name_override: Option<&str>) -> RelayResult<Self> {
        let name = match name_override {
            Some(name) => name.to_string(),
            None => definition.name.ok_or_else(|| RelayError::malformed("Missing required field: name"))?,
        };
        if is_empty_or_whitespace(&name) {
            return Err(RelayError::malformed("Route name must not be empty"));
        }
        let protocol = definition.protocol.ok_or_else(|| RelayError::malformed("Missing required field: protocol"))?;
        let listen = definition.listen.ok_or_else(|| RelayError::malformed("Missing required field: listen"))?;
        let forward = definition.forward.ok_or_else(|| RelayError::malformed("Missing required field: forward"))?;
        listen.validate("listen")?;
        forward.validate("forward")?;

        Ok(Self { name: name.trim().to_string(), protocol, listen, forward, enabled: definition.enabled.unwrap_or(true) })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn get_listen(&self) -> &Endpoint {
        &self.listen
    }

    pub fn get_forward(&self) -> &Endpoint {
        &self.forward
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Two routes collide when they would bind the same (protocol, host, port).
    pub fn collides_with(&self, other: &Route) -> bool {
        self.protocol == other.protocol && self.listen.same_address(&other.listen)
    }
}

impl TryFrom<RouteDefinition> for Route {
    type Error = RelayError;

    fn try_from(definition: RouteDefinition) -> Result<Self, Self::Error> {
        Self::from_definition(definition, None)
    }
}

impl From<Route> for RouteDefinition {
    fn from(route: Route) -> Self {
        Self {
            name: Some(route.name),
            protocol: Some(route.protocol),
            listen: Some(route.listen),
            forward: Some(route.forward),
            enabled: Some(route.enabled),
        }
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {} -> {}{}",
            self.name,
            self.protocol,
            self.listen,
            self.forward,
            if self.enabled { "" } else { " (disabled)" }
        )
    }
}

/// A route annotated with whether a listener is currently running for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStatus {
    #[serde(flatten)]
    pub route: RouteDefinition,
    pub active: bool,
}
