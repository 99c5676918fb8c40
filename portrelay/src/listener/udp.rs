use crate::listener::is_fatal;
use crate::relay::SessionTable;
use crate::relay::session::MAX_DATAGRAM;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Receive datagrams until the shutdown signal fires. Datagrams are handed to the
/// session table one at a time, in arrival order.
pub(crate) async fn recv_loop(socket: Arc<UdpSocket>, sessions: Arc<SessionTable>, route_name: String, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = shutdown.changed() => {
                debug!("[{}] Receive loop stopping", route_name);
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((n, client)) => sessions.handle_datagram(&socket, &buf[..n], client).await,
            // Windows reports ICMP port-unreachable for an earlier reply as a reset on the next recv.
            Err(e) if !is_fatal(&e) => {
                warn!("[{}] Receive error: {}", route_name, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
