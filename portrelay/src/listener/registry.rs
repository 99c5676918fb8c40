use crate::error::{RelayError, RelayResult};
use crate::listener::{tcp, udp};
use crate::relay::{ConnectionRelay, SessionTable};
use crate::route::{Endpoint, Protocol, Route};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

type ActiveMap = HashMap<String, ActiveListener>;

/// Runtime state of one running route.
struct ActiveListener {
    id: u64,
    route: Route,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    sessions: Option<Arc<SessionTable>>,
    task: JoinHandle<()>,
}

impl ActiveListener {
    /// Stop accepting, then close every session. The listening socket is released once
    /// the returned task handle completes.
    async fn wind_down(self) -> JoinHandle<()> {
        let _ = self.shutdown.send(true);
        if let Some(sessions) = &self.sessions {
            sessions.close_all().await;
        }
        self.task
    }
}

/// Snapshot of a running listener, as reported by [`ListenerRegistry::list_active`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSummary {
    pub name: String,
    pub protocol: Protocol,
    pub listen: Endpoint,
    pub forward: Endpoint,
    pub local_addr: SocketAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_created: Option<u64>,
}

/// Owns every bound listener, keyed by route name.
///
/// At most one listener exists per route name and per (protocol, host, port).
pub struct ListenerRegistry {
    active: Arc<Mutex<ActiveMap>>,
    idle_timeout: Duration,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { active: Arc::new(Mutex::new(HashMap::new())), idle_timeout, next_id: AtomicU64::new(1) }
    }

    /// Bind the route's listen endpoint and start dispatching traffic.
    ///
    /// Returns the locally bound address. Fails with `AddressInUse` when another running
    /// route holds the same address (no bind is attempted), or `Bind` when the OS refuses.
    pub async fn start_route(&self, route: &Route) -> RelayResult<SocketAddr> {
        let mut active = self.active.lock().await;
        if active.contains_key(route.get_name()) {
            return Err(RelayError::DuplicateName(route.get_name().to_string()));
        }
        if let Some(holder) = active.values().find(|l| l.route.collides_with(route)) {
            let e = RelayError::AddressInUse { protocol: route.get_protocol(), address: route.get_listen().clone(), holder: holder.route.get_name().to_string() };
            warn!("[{}] {}", route.get_name(), e);
            return Err(e);
        }

        let name = route.get_name().to_string();
        let listen = route.get_listen();
        let bind_error = |source: std::io::Error| RelayError::Bind { protocol: route.get_protocol(), address: listen.clone(), source };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown, signal) = watch::channel(false);
        let registry = Arc::downgrade(&self.active);

        let (local_addr, sessions, task) = match route.get_protocol() {
            Protocol::Tcp => {
                let listener = TcpListener::bind((listen.bare_host(), listen.port)).await.map_err(bind_error)?;
                let local_addr = listener.local_addr().map_err(bind_error)?;
                let relay = Arc::new(ConnectionRelay::new(name.clone(), route.get_forward().clone()));
                let run = tcp::accept_loop(listener, relay, name.clone(), signal);
                (local_addr, None, tokio::spawn(supervise(registry, name.clone(), id, local_addr, run)))
            }
            Protocol::Udp => {
                let socket = Arc::new(UdpSocket::bind((listen.bare_host(), listen.port)).await.map_err(bind_error)?);
                let local_addr = socket.local_addr().map_err(bind_error)?;
                let sessions = SessionTable::new(name.clone(), route.get_forward().clone(), self.idle_timeout);
                let run = udp::recv_loop(socket, sessions.clone(), name.clone(), signal);
                (local_addr, Some(sessions), tokio::spawn(supervise(registry, name.clone(), id, local_addr, run)))
            }
        };

        info!("[{}] {} listener started on {} -> {}", name, route.get_protocol(), local_addr, route.get_forward());
        active.insert(name, ActiveListener { id, route: route.clone(), local_addr, shutdown, sessions, task });
        Ok(local_addr)
    }

    /// Stop a running route. Returns false when nothing was running under that name.
    pub async fn stop_route(&self, name: &str) -> bool {
        let Some(listener) = self.active.lock().await.remove(name) else {
            debug!("[{}] Not running, nothing to stop", name);
            return false;
        };
        let local_addr = listener.local_addr;
        let _ = listener.wind_down().await.await;
        info!("[{}] Listener on {} stopped", name, local_addr);
        true
    }

    /// Stop every running route. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(String, ActiveListener)> = self.active.lock().await.drain().collect();
        let count = drained.len();
        for (name, listener) in drained {
            let local_addr = listener.local_addr;
            let _ = listener.wind_down().await.await;
            info!("[{}] Listener on {} stopped", name, local_addr);
        }
        count
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.active.lock().await.contains_key(name)
    }

    pub async fn active_names(&self) -> Vec<String> {
        self.active.lock().await.keys().cloned().collect()
    }

    pub async fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.active.lock().await.get(name).map(|l| l.local_addr)
    }

    /// Live session count of a running udp route.
    pub async fn session_count(&self, name: &str) -> Option<usize> {
        let sessions = self.active.lock().await.get(name).and_then(|l| l.sessions.clone())?;
        Some(sessions.len().await)
    }

    pub async fn list_active(&self) -> Vec<ActiveSummary> {
        let snapshot: Vec<(Route, SocketAddr, Option<Arc<SessionTable>>)> =
            self.active.lock().await.values().map(|l| (l.route.clone(), l.local_addr, l.sessions.clone())).collect();
        let mut summaries = Vec::with_capacity(snapshot.len());
        for (route, local_addr, sessions) in snapshot {
            let (live, created) = match sessions {
                Some(table) => (Some(table.len().await), Some(table.total_created())),
                None => (None, None),
            };
            summaries.push(ActiveSummary {
                name: route.get_name().to_string(),
                protocol: route.get_protocol(),
                listen: route.get_listen().clone(),
                forward: route.get_forward().clone(),
                local_addr,
                sessions: live,
                sessions_created: created,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

/// Run a listener loop; when it fails, drop the listener from the registry if it is
/// still the same generation.
async fn supervise(registry: Weak<Mutex<ActiveMap>>, name: String, id: u64, local_addr: SocketAddr, run: impl Future<Output = std::io::Result<()>>) {
    let Err(e) = run.await else { return };
    error!("[{}] Listener on {} failed: {}", name, local_addr, e);
    let Some(registry) = registry.upgrade() else { return };
    let failed = {
        let mut active = registry.lock().await;
        match active.get(&name) {
            Some(listener) if listener.id == id => active.remove(&name),
            _ => None,
        }
    };
    if let Some(listener) = failed {
        // This task is the listener task, so its handle is dropped rather than awaited.
        drop(listener.wind_down().await);
        warn!("[{}] Removed from the active set after a listener failure", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{free_tcp_port, free_udp_port, spawn_tcp_echo, spawn_udp_echo, udp_exchange};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn route(name: &str, protocol: Protocol, listen_port: u16, forward: SocketAddr) -> Route {
        Route::new(name, protocol, Endpoint::new("127.0.0.1", listen_port), Endpoint::new("127.0.0.1", forward.port()), true).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_route_relays() {
        let backend = spawn_tcp_echo().await;
        let registry = ListenerRegistry::new(Duration::from_secs(30));
        let port = free_tcp_port();
        let addr = registry.start_route(&route("web", Protocol::Tcp, port, backend)).await.unwrap();
        assert_eq!(addr.port(), port);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"through the relay").await.unwrap();
        let mut buf = [0u8; 17];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the relay");
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_udp_route_relays_and_reports_sessions() {
        let backend = spawn_udp_echo().await;
        let registry = ListenerRegistry::new(Duration::from_secs(30));
        let addr = registry.start_route(&route("dns", Protocol::Udp, free_udp_port(), backend.addr)).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(udp_exchange(&client, addr, b"query").await.unwrap(), b"query");
        assert_eq!(registry.session_count("dns").await, Some(1));

        let summary = registry.list_active().await;
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].protocol, Protocol::Udp);
        assert_eq!(summary[0].sessions, Some(1));
        assert_eq!(summary[0].sessions_created, Some(1));

        assert!(registry.stop_route("dns").await);
        // The address is free again once stop_route returns.
        UdpSocket::bind(addr).await.unwrap();
    }

    #[tokio::test]
    async fn test_address_collision_is_rejected_before_bind() {
        let backend = spawn_tcp_echo().await;
        let registry = ListenerRegistry::new(Duration::from_secs(30));
        let port = free_tcp_port();
        registry.start_route(&route("first", Protocol::Tcp, port, backend)).await.unwrap();

        let err = registry.start_route(&route("second", Protocol::Tcp, port, backend)).await.unwrap_err();
        match err {
            RelayError::AddressInUse { holder, .. } => assert_eq!(holder, "first"),
            other => panic!("unexpected error: {}", other),
        }
        assert!(registry.is_active("first").await);
        assert!(!registry.is_active("second").await);

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_os_bind_failure_is_reported() {
        let backend = spawn_tcp_echo().await;
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let registry = ListenerRegistry::new(Duration::from_secs(30));

        let err = registry.start_route(&route("web", Protocol::Tcp, port, backend)).await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));
        assert!(registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let backend = spawn_tcp_echo().await;
        let registry = ListenerRegistry::new(Duration::from_secs(30));
        assert!(!registry.stop_route("ghost").await);

        let port = free_tcp_port();
        registry.start_route(&route("web", Protocol::Tcp, port, backend)).await.unwrap();
        assert!(registry.stop_route("web").await);
        assert!(!registry.stop_route("web").await);
    }

    #[tokio::test]
    async fn test_stop_all_releases_addresses() {
        let backend = spawn_tcp_echo().await;
        let registry = ListenerRegistry::new(Duration::from_secs(30));
        let ports = [free_tcp_port(), free_tcp_port()];
        for (i, port) in ports.iter().enumerate() {
            registry.start_route(&route(&format!("r{}", i), Protocol::Tcp, *port, backend)).await.unwrap();
        }
        assert_eq!(registry.stop_all().await, 2);
        assert!(registry.active_names().await.is_empty());

        for (i, port) in ports.iter().enumerate() {
            registry.start_route(&route(&format!("r{}", i), Protocol::Tcp, *port, backend)).await.unwrap();
        }
        assert_eq!(registry.stop_all().await, 2);
    }

    async fn generation(registry: &ListenerRegistry, name: &str) -> u64 {
        registry.active.lock().await.get(name).map(|l| l.id).unwrap()
    }

    #[tokio::test]
    async fn test_failed_listener_is_dropped_and_siblings_keep_running() {
        let backend = spawn_tcp_echo().await;
        let registry = ListenerRegistry::new(Duration::from_secs(30));
        let failing = registry.start_route(&route("failing", Protocol::Tcp, free_tcp_port(), backend)).await.unwrap();
        let sibling = registry.start_route(&route("sibling", Protocol::Tcp, free_tcp_port(), backend)).await.unwrap();

        let id = generation(&registry, "failing").await;
        let broken = async { Err::<(), _>(std::io::Error::from(std::io::ErrorKind::InvalidInput)) };
        supervise(Arc::downgrade(&registry.active), "failing".to_string(), id, failing, broken).await;

        let names: Vec<String> = registry.list_active().await.into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["sibling".to_string()]);

        let mut client = TcpStream::connect(sibling).await.unwrap();
        client.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        // The failed route's name can be started again.
        registry.start_route(&route("failing", Protocol::Tcp, free_tcp_port(), backend)).await.unwrap();
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_stale_failure_leaves_newer_listener() {
        let backend = spawn_tcp_echo().await;
        let registry = ListenerRegistry::new(Duration::from_secs(30));
        let port = free_tcp_port();
        let addr = registry.start_route(&route("web", Protocol::Tcp, port, backend)).await.unwrap();
        let old_id = generation(&registry, "web").await;
        assert!(registry.stop_route("web").await);
        registry.start_route(&route("web", Protocol::Tcp, port, backend)).await.unwrap();
        assert_ne!(generation(&registry, "web").await, old_id);

        let broken = async { Err::<(), _>(std::io::Error::from(std::io::ErrorKind::InvalidInput)) };
        supervise(Arc::downgrade(&registry.active), "web".to_string(), old_id, addr, broken).await;
        assert!(registry.is_active("web").await);

        let clean_exit = async { Ok::<(), std::io::Error>(()) };
        supervise(Arc::downgrade(&registry.active), "web".to_string(), generation(&registry, "web").await, addr, clean_exit).await;
        assert!(registry.is_active("web").await);
        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_closes_open_connections() {
        let backend = spawn_tcp_echo().await;
        let registry = ListenerRegistry::new(Duration::from_secs(30));
        let addr = registry.start_route(&route("web", Protocol::Tcp, free_tcp_port(), backend)).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        registry.stop_route("web").await;
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await.unwrap();
        assert!(read.is_err() || rest.is_empty());
    }
}
