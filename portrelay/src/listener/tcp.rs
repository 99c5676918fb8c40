use crate::listener::is_fatal;
use crate::relay::ConnectionRelay;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::TcpListenerStream;

/// Accept connections until the shutdown signal fires. Returns an error only when the
/// listening socket itself has failed.
pub(crate) async fn accept_loop(listener: TcpListener, relay: Arc<ConnectionRelay>, route_name: String, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
    let mut incoming = TcpListenerStream::new(listener);
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => {
                debug!("[{}] Accept loop stopping", route_name);
                return Ok(());
            }
            next = incoming.next() => next,
        };
        match next {
            Some(Ok(stream)) => {
                let peer = match stream.peer_addr() {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!("[{}] Accepted a connection that is already gone: {}", route_name, e);
                        continue;
                    }
                };
                let relay = relay.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { relay.relay(stream, peer, shutdown).await });
            }
            Some(Err(e)) if !is_fatal(&e) => {
                warn!("[{}] Accept error: {}", route_name, e);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}
