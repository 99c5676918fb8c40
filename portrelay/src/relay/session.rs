//! Per-client session tracking for connectionless (udp) routes.
//!
//! Every client endpoint seen on a route's listening socket gets a [`Session`] with
//! its own outbound socket connected to the forward endpoint. Replies arriving on
//! that socket are sent back to the client through the shared listening socket.
//!
//! All mutations of the table go through one lock. Forwarding a datagram, refreshing
//! activity and evicting a session are mutually exclusive for a given table, so a
//! session is removed exactly once and its socket is never used after eviction.

use crate::error::{RelayError, RelayResult};
use crate::route::Endpoint;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Largest datagram the relay will carry.
pub const MAX_DATAGRAM: usize = 65_535;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);
const RESOLVE_REFRESH: Duration = Duration::from_secs(60);

/// One client endpoint's state.
struct Session {
    /// Generation id; a timer or reader only acts on the session it was spawned for.
    id: u64,
    outbound: Arc<UdpSocket>,
    last_activity: Instant,
    idle_timer: JoinHandle<()>,
    backend_reader: JoinHandle<()>,
}

impl Session {
    /// Cancel the idle timer and the backend reader. The outbound socket is closed
    /// once the returned reader handle has finished.
    fn close(self) -> JoinHandle<()> {
        self.idle_timer.abort();
        self.backend_reader.abort();
        self.backend_reader
    }
}

#[derive(Default)]
struct TableState {
    sessions: HashMap<SocketAddr, Session>,
    closed: bool,
}

/// The session table owned by one udp ActiveListener.
pub struct SessionTable {
    route_name: String,
    forward: Endpoint,
    idle_timeout: Duration,
    state: Mutex<TableState>,
    /// Last resolved forward address and when it was resolved.
    resolved: Mutex<Option<(SocketAddr, Instant)>>,
    refreshing: AtomicBool,
    next_id: AtomicU64,
    total_created: AtomicU64,
    total_evicted: AtomicU64,
}

impl SessionTable {
    /// Must be called from within a tokio runtime; the forward address is resolved in the background.
    pub fn new(route_name: impl Into<String>, forward: Endpoint, idle_timeout: Duration) -> Arc<Self> {
        let table = Arc::new(Self {
            route_name: route_name.into(),
            forward,
            idle_timeout,
            state: Mutex::new(TableState::default()),
            resolved: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            total_created: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        });
        table.spawn_refresh();
        table
    }

    /// Process one datagram received on `listener` from `client`.
    ///
    /// Datagrams are handled one at a time by the listener's receive loop, which keeps
    /// per-client ordering and makes it the only place sessions are created.
    pub async fn handle_datagram(self: &Arc<Self>, listener: &Arc<UdpSocket>, payload: &[u8], client: SocketAddr) {
        {
            let mut state = self.state.lock().await;
            if let Some(session) = state.sessions.get_mut(&client) {
                session.last_activity = Instant::now();
                self.forward_to_backend(&session.outbound, payload, client).await;
                return;
            }
        }

        // Resolution and bind happen outside the lock so replies on other sessions keep flowing.
        let outbound = match self.open_outbound().await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("[{}] Dropping datagram from {}: could not open a session: {}", self.route_name, client, e);
                return;
            }
        };

        let mut state = self.state.lock().await;
        if state.closed {
            debug!("[{}] Listener stopping, not creating a session for {}", self.route_name, client);
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            id,
            outbound: outbound.clone(),
            last_activity: Instant::now(),
            idle_timer: tokio::spawn(run_idle_timer(Arc::downgrade(self), client, id, self.idle_timeout)),
            backend_reader: tokio::spawn(run_backend_reader(Arc::downgrade(self), listener.clone(), outbound, client, id)),
        };
        self.total_created.fetch_add(1, Ordering::Relaxed);
        info!(
            "[{}] New session for {} via {} -> {}",
            self.route_name,
            client,
            session.outbound.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string()),
            self.forward
        );
        self.forward_to_backend(&session.outbound, payload, client).await;
        state.sessions.insert(client, session);
    }

    async fn open_outbound(self: &Arc<Self>) -> RelayResult<UdpSocket> {
        let target = self.backend_addr().await?;
        connect_outbound(&self.forward, target).await
    }

    /// Address new sessions connect to. Once an address is cached it is returned at once and
    /// refreshed in the background when stale, so only a table's first lookup waits on the resolver.
    async fn backend_addr(self: &Arc<Self>) -> RelayResult<SocketAddr> {
        let cached = *self.resolved.lock().await;
        match cached {
            Some((addr, resolved_at)) => {
                if resolved_at.elapsed() >= RESOLVE_REFRESH {
                    self.spawn_refresh();
                }
                Ok(addr)
            }
            None => {
                let addr = resolve(&self.forward).await?;
                *self.resolved.lock().await = Some((addr, Instant::now()));
                Ok(addr)
            }
        }
    }

    fn spawn_refresh(self: &Arc<Self>) {
        if self.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let table = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(table) = table.upgrade() else { return };
            match resolve(&table.forward).await {
                Ok(addr) => {
                    debug!("[{}] {} resolved to {}", table.route_name, table.forward, addr);
                    *table.resolved.lock().await = Some((addr, Instant::now()));
                }
                // A stale address is kept; new sessions keep using it until a lookup succeeds.
                Err(e) => warn!("[{}] {}", table.route_name, e),
            }
            table.refreshing.store(false, Ordering::Release);
        });
    }

    async fn forward_to_backend(&self, outbound: &UdpSocket, payload: &[u8], client: SocketAddr) {
        if let Err(source) = outbound.send(payload).await {
            let e = RelayError::TransientIo { context: format!("forwarding a datagram from {} to {}", client, self.forward), source };
            warn!("[{}] {}", self.route_name, e);
        }
    }

    /// Refresh a session's activity. Returns false when the session no longer exists.
    async fn touch(&self, client: SocketAddr, id: u64) -> bool {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&client) {
            Some(session) if session.id == id => {
                session.last_activity = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Evict the session if it has been idle for the full timeout.
    /// Returns the next deadline to check while it is still active.
    async fn expire_if_idle(&self, client: SocketAddr, id: u64) -> Option<Instant> {
        let mut state = self.state.lock().await;
        let deadline = match state.sessions.get(&client) {
            Some(session) if session.id == id => session.last_activity + self.idle_timeout,
            _ => return None,
        };
        if deadline > Instant::now() {
            return Some(deadline);
        }
        let session = state.sessions.remove(&client)?;
        drop(state);

        info!("[{}] Session for {} evicted after {:?} idle", self.route_name, client, self.idle_timeout);
        self.total_evicted.fetch_add(1, Ordering::Relaxed);
        drop(session.close());
        None
    }

    /// Close every session and refuse new ones. Returns after all backend readers are gone,
    /// so no session still holds the listening socket.
    pub async fn close_all(&self) {
        let drained: Vec<(SocketAddr, Session)> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.sessions.drain().collect()
        };
        let count = drained.len();
        for (client, session) in drained {
            let reader = session.close();
            let _ = reader.await;
            debug!("[{}] Closed session for {}", self.route_name, client);
        }
        if count > 0 {
            info!("[{}] Closed {} session(s)", self.route_name, count);
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, client: SocketAddr) -> bool {
        self.state.lock().await.sessions.contains_key(&client)
    }

    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }

    pub fn total_evicted(&self) -> u64 {
        self.total_evicted.load(Ordering::Relaxed)
    }
}

/// Resolve the forward endpoint to one address, giving up after [`RESOLVE_TIMEOUT`].
async fn resolve(forward: &Endpoint) -> RelayResult<SocketAddr> {
    let dial_error = |source: std::io::Error| RelayError::Dial { address: forward.clone(), source };
    let lookup = tokio::net::lookup_host((forward.bare_host(), forward.port));
    let mut addrs = match tokio::time::timeout(RESOLVE_TIMEOUT, lookup).await {
        Ok(result) => result.map_err(dial_error)?,
        Err(_) => return Err(dial_error(std::io::Error::new(std::io::ErrorKind::TimedOut, "name resolution timed out"))),
    };
    addrs.next().ok_or_else(|| dial_error(std::io::Error::new(std::io::ErrorKind::NotFound, "host resolved to no addresses")))
}

/// Open a socket dedicated to one session, connected to `target`.
async fn connect_outbound(forward: &Endpoint, target: SocketAddr) -> RelayResult<UdpSocket> {
    let dial_error = |source: std::io::Error| RelayError::Dial { address: forward.clone(), source };
    let local: SocketAddr = if target.is_ipv4() { (Ipv4Addr::UNSPECIFIED, 0).into() } else { (Ipv6Addr::UNSPECIFIED, 0).into() };
    let socket = UdpSocket::bind(local).await.map_err(dial_error)?;
    socket.connect(target).await.map_err(dial_error)?;
    Ok(socket)
}

async fn run_idle_timer(table: Weak<SessionTable>, client: SocketAddr, id: u64, idle_timeout: Duration) {
    let mut deadline = Instant::now() + idle_timeout;
    loop {
        tokio::time::sleep_until(deadline).await;
        let Some(table) = table.upgrade() else { return };
        match table.expire_if_idle(client, id).await {
            Some(next) => deadline = next,
            None => return,
        }
    }
}

async fn run_backend_reader(table: Weak<SessionTable>, listener: Arc<UdpSocket>, outbound: Arc<UdpSocket>, client: SocketAddr, id: u64) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = outbound.recv(&mut buf).await;
        let Some(table) = table.upgrade() else { return };
        match received {
            Ok(n) => {
                if !table.touch(client, id).await {
                    return;
                }
                if let Err(source) = listener.send_to(&buf[..n], client).await {
                    let e = RelayError::TransientIo { context: format!("replying to {}", client), source };
                    warn!("[{}] {}", table.route_name, e);
                }
            }
            Err(source) => {
                // Typically an ICMP unreachable from the backend; the session stays up.
                let e = RelayError::TransientIo { context: format!("receiving from {}", table.forward), source };
                warn!("[{}] {}", table.route_name, e);
                drop(table);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
