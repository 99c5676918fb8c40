use crate::error::{RelayError, RelayResult};
use crate::route::Endpoint;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipes accepted tcp connections of one route to its forward endpoint.
///
/// Closure is symmetric: the first direction to finish or fail tears down both
/// connections. Half-close is not passed through.
#[derive(Debug)]
pub struct ConnectionRelay {
    route_name: String,
    forward: Endpoint,
}

enum Closure {
    Client(std::io::Result<u64>),
    Backend(std::io::Result<u64>),
    Shutdown,
}

impl ConnectionRelay {
    pub fn new(route_name: impl Into<String>, forward: Endpoint) -> Self {
        Self { route_name: route_name.into(), forward }
    }

    /// Relay one inbound connection. A failed dial drops (closes) the inbound connection.
    pub async fn relay(&self, mut inbound: TcpStream, peer: SocketAddr, mut shutdown: watch::Receiver<bool>) {
        let mut outbound = match dial(&self.forward).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("[{}] Dropping connection from {}: {}", self.route_name, peer, e);
                let _ = inbound.shutdown().await;
                return;
            }
        };
        info!("[{}] Connection from {} relayed to {}", self.route_name, peer, self.forward);
        let _ = inbound.set_nodelay(true);
        let _ = outbound.set_nodelay(true);

        if *shutdown.borrow_and_update() {
            debug!("[{}] Listener stopped before relaying {}", self.route_name, peer);
            return;
        }

        let (mut client_read, mut client_write) = inbound.split();
        let (mut backend_read, mut backend_write) = outbound.split();
        let closure = tokio::select! {
            copied = tokio::io::copy(&mut client_read, &mut backend_write) => Closure::Client(copied),
            copied = tokio::io::copy(&mut backend_read, &mut client_write) => Closure::Backend(copied),
            _ = shutdown.changed() => Closure::Shutdown,
        };

        match closure {
            Closure::Client(Ok(bytes)) => info!("[{}] Client {} disconnected after sending {} bytes", self.route_name, peer, bytes),
            Closure::Backend(Ok(bytes)) => {
                info!("[{}] Backend {} closed the connection for {} after {} bytes", self.route_name, self.forward, peer, bytes)
            }
            Closure::Client(Err(source)) | Closure::Backend(Err(source)) => {
                let e = RelayError::TransientIo { context: format!("relaying {} <-> {}", peer, self.forward), source };
                warn!("[{}] {}; closing both sides", self.route_name, e);
            }
            Closure::Shutdown => debug!("[{}] Closing connection from {}: listener stopped", self.route_name, peer),
        }
        // Both streams drop here, closing the surviving side as well.
    }
}

/// Open a connection to a forward endpoint.
pub async fn dial(forward: &Endpoint) -> RelayResult<TcpStream> {
    let connect = TcpStream::connect((forward.bare_host(), forward.port));
    match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(RelayError::Dial { address: forward.clone(), source }),
        Err(_) => Err(RelayError::Dial {
            address: forward.clone(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        }),
    }
}
