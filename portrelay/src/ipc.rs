//! Local IPC through which a running daemon announces itself to later CLI invocations.

use interprocess::local_socket::tokio::{Stream, prelude::*};
use interprocess::local_socket::{GenericNamespaced, ListenerOptions, Name, ToNsName};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SOCKET_NAME: &str = "portrelay_instance_v1"; // Cross-platform local socket / named pipe name
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// What a running daemon tells other processes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub config_path: String,
    /// `host:port` of the control API.
    pub control_addr: String,
}

fn socket_name() -> Option<Name<'static>> {
    SOCKET_NAME.to_ns_name::<GenericNamespaced>().ok()
}

/// Ask a running instance for its details. Returns None if no instance is listening.
pub async fn get_running_instance() -> Option<InstanceInfo> {
    let name = socket_name()?;
    let mut stream = Stream::connect(name).await.ok()?;
    let mut buf = Vec::with_capacity(256);
    match tokio::time::timeout(QUERY_TIMEOUT, stream.read_to_end(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!("IPC read error: {}", e);
            return None;
        }
        Err(_) => {
            warn!("IPC peer did not answer within {:?}", QUERY_TIMEOUT);
            return None;
        }
    }
    serde_json::from_slice::<InstanceInfo>(&buf).map_err(|e| warn!("Ignoring malformed instance info: {}", e)).ok()
}

/// Serve `info` to every connector from a background task.
/// Best-effort; if binding fails (another instance active), we log and return.
pub fn start_ipc_server(info: InstanceInfo) {
    tokio::spawn(async move {
        let payload = match serde_json::to_vec(&info) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode instance info: {}", e);
                return;
            }
        };
        let Some(name) = socket_name() else { return };
        let listener = match ListenerOptions::new().name(name).create_tokio() {
            Ok(listener) => listener,
            Err(e) => {
                warn!("IPC server bind failed (likely already running): {}", e);
                return;
            }
        };
        debug!("IPC server listening on '{}'", SOCKET_NAME);
        loop {
            match listener.accept().await {
                Ok(mut stream) => {
                    trace!("IPC client connected, sending instance info");
                    let _ = stream.write_all(&payload).await;
                    let _ = stream.flush().await;
                }
                Err(e) => {
                    warn!("IPC accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    });
}
