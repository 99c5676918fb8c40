//! Loopback helpers shared by the async tests.

use std::collections::HashSet;
use std::net::{SocketAddr, TcpListener as StdTcpListener, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;

/// A port that was free a moment ago. Nothing listens on it.
pub fn free_tcp_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

pub fn free_udp_port() -> u16 {
    StdUdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Tcp echo server, one task per connection.
pub async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Tcp server that answers every connection with a fixed greeting and closes it.
pub async fn spawn_tcp_banner(banner: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(banner).await;
        }
    });
    addr
}

/// Udp echo server that remembers which source endpoints it has heard from.
pub struct UdpEcho {
    pub addr: SocketAddr,
    seen: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl UdpEcho {
    /// Distinct source endpoints seen so far.
    pub async fn sources(&self) -> HashSet<SocketAddr> {
        self.seen.lock().await.clone()
    }
}

pub async fn spawn_udp_echo() -> UdpEcho {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let recorded = seen.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            recorded.lock().await.insert(from);
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    UdpEcho { addr, seen }
}

/// Send one datagram and wait for the reply.
pub async fn udp_exchange(client: &UdpSocket, to: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    client.send_to(payload, to).await.ok()?;
    let mut buf = vec![0u8; 65_535];
    let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(2), client.recv_from(&mut buf)).await.ok()?.ok()?;
    buf.truncate(n);
    Some(buf)
}
