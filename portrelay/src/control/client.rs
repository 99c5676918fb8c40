use crate::control::{ControlResponse, ListenerList, RouteList};
use crate::listener::ActiveSummary;
use crate::route::{RouteDefinition, RouteStatus};
use anyhow::{Result, anyhow};
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request, StatusCode};
use log::debug;
use std::fmt::Display;

/// Client for a running instance's control API.
#[derive(Clone)]
pub struct ControlClient {
    base: String,
    http: Client<HttpConnector>,
}

impl ControlClient {
    /// `addr` is the control API's `host:port`.
    pub fn new(addr: impl Display) -> Self {
        Self { base: format!("http://{}", addr), http: Client::new() }
    }

    pub async fn list_routes(&self) -> Result<Vec<RouteStatus>> {
        let (status, body) = self.send(Method::GET, "/api/routes", None).await?;
        expect_success(status, &body)?;
        Ok(serde_json::from_slice::<RouteList>(&body)?.routes)
    }

    pub async fn get_route(&self, name: &str) -> Result<Option<RouteStatus>> {
        let (status, body) = self.send(Method::GET, &route_path(name), None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        expect_success(status, &body)?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    pub async fn list_listeners(&self) -> Result<Vec<ActiveSummary>> {
        let (status, body) = self.send(Method::GET, "/api/listeners", None).await?;
        expect_success(status, &body)?;
        Ok(serde_json::from_slice::<ListenerList>(&body)?.listeners)
    }

    pub async fn add_route(&self, definition: &RouteDefinition) -> Result<ControlResponse> {
        self.mutate(Method::POST, "/api/routes", Some(definition)).await
    }

    pub async fn update_route(&self, name: &str, definition: &RouteDefinition) -> Result<ControlResponse> {
        self.mutate(Method::PUT, &route_path(name), Some(definition)).await
    }

    pub async fn remove_route(&self, name: &str) -> Result<ControlResponse> {
        self.mutate(Method::DELETE, &route_path(name), None).await
    }

    pub async fn toggle_route(&self, name: &str) -> Result<ControlResponse> {
        self.mutate(Method::POST, &format!("{}/toggle", route_path(name)), None).await
    }

    pub async fn restart(&self) -> Result<ControlResponse> {
        self.mutate(Method::POST, "/api/restart", None).await
    }

    async fn mutate(&self, method: Method, path: &str, definition: Option<&RouteDefinition>) -> Result<ControlResponse> {
        let (status, body) = self.send(method, path, definition).await?;
        serde_json::from_slice(&body).map_err(|e| anyhow!("Unexpected response from control API ({}): {}", status, e))
    }

    async fn send(&self, method: Method, path: &str, definition: Option<&RouteDefinition>) -> Result<(StatusCode, Bytes)> {
        let body = match definition {
            Some(definition) => Body::from(serde_json::to_vec(definition)?),
            None => Body::empty(),
        };
        let uri = format!("{}{}", self.base, path);
        debug!("{} {}", method, uri);
        let request = Request::builder().method(method).uri(&uri).header(CONTENT_TYPE, "application/json").body(body)?;
        let response = self.http.request(request).await.map_err(|e| anyhow!("Control API at {} is unreachable: {}", self.base, e))?;
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok((status, body))
    }
}

fn route_path(name: &str) -> String {
    format!("/api/routes/{}", urlencoding::encode(name))
}

fn expect_success(status: StatusCode, body: &[u8]) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    match serde_json::from_slice::<ControlResponse>(body) {
        Ok(response) => Err(anyhow!("{} ({})", response.message, status)),
        Err(_) => Err(anyhow!("Control API returned {}", status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::control::http_server::start_control_server_on;
    use crate::orchestrator::LifecycleOrchestrator;
    use crate::route::{Endpoint, Protocol};
    use crate::test_support::{free_tcp_port, spawn_tcp_echo};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_client_drives_a_live_server() {
        let engine = Arc::new(LifecycleOrchestrator::new(Duration::from_secs(30), Arc::new(MemoryStore::default())));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(start_control_server_on(engine.clone(), listener, async move {
            let _ = stopped.await;
        }));

        let client = ControlClient::new(addr);
        let backend = spawn_tcp_echo().await;
        let definition = RouteDefinition {
            name: Some("web/1".to_string()),
            protocol: Some(Protocol::Tcp),
            listen: Some(Endpoint::new("127.0.0.1", free_tcp_port())),
            forward: Some(Endpoint::new("127.0.0.1", backend.port())),
            enabled: Some(true),
        };
        assert!(client.add_route(&definition).await.unwrap().success);
        assert!(!client.add_route(&definition).await.unwrap().success);

        let routes = client.list_routes().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert!(routes[0].active);
        assert_eq!(client.list_listeners().await.unwrap().len(), 1);
        assert!(client.get_route("web/1").await.unwrap().is_some());
        assert!(client.get_route("missing").await.unwrap().is_none());

        assert!(client.toggle_route("web/1").await.unwrap().success);
        assert!(client.list_listeners().await.unwrap().is_empty());
        assert!(client.restart().await.unwrap().success);
        assert!(client.remove_route("web/1").await.unwrap().success);
        assert!(!client.remove_route("web/1").await.unwrap().success);

        let _ = stop.send(());
        server.await.unwrap().unwrap();
        engine.stop_all().await;
    }

    #[test]
    fn test_route_path_escapes_name() {
        assert_eq!(route_path("web"), "/api/routes/web");
        assert_eq!(route_path("my route/x"), "/api/routes/my%20route%2Fx");
    }

    #[tokio::test]
    async fn test_unreachable_instance_is_an_error() {
        let client = ControlClient::new(format!("127.0.0.1:{}", free_tcp_port()));
        let err = client.list_routes().await.unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }
}
