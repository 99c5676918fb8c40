use crate::control::{ControlResponse, ListenerList, RouteList};
use crate::error::{RelayError, RelayResult};
use crate::orchestrator::LifecycleOrchestrator;
use crate::route::RouteDefinition;
use anyhow::Result;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use log::{error, info, trace, warn};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Serve the control API on `addr` until `shutdown` resolves.
pub async fn start_control_server(orchestrator: Arc<LifecycleOrchestrator>, addr: SocketAddr, shutdown: impl Future<Output = ()>) -> Result<()> {
    let builder = hyper::Server::try_bind(&addr).map_err(|e| anyhow::anyhow!("Failed to bind control API on {}: {}", addr, e))?;
    serve(orchestrator, builder, shutdown).await
}

/// Serve the control API on an already bound listener.
pub async fn start_control_server_on(orchestrator: Arc<LifecycleOrchestrator>, listener: std::net::TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
    let builder = hyper::Server::from_tcp(listener)?;
    serve(orchestrator, builder, shutdown).await
}

async fn serve(orchestrator: Arc<LifecycleOrchestrator>, builder: hyper::server::Builder<AddrIncoming>, shutdown: impl Future<Output = ()>) -> Result<()> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let remote_addr = conn.remote_addr();
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    trace!("{} {} from {}", req.method(), req.uri().path(), remote_addr);
                    Ok::<_, Infallible>(handle_request(&orchestrator, req).await)
                }
            }))
        }
    });

    let server = builder.serve(make_svc);
    info!("Control API running on {}", server.local_addr());
    if let Err(e) = server.with_graceful_shutdown(shutdown).await {
        error!("Control API error: {}", e);
        return Err(e.into());
    }
    info!("Control API stopped");
    Ok(())
}

/// Percent-decode one path segment. Invalid utf-8 is replaced rather than rejected.
fn decode_segment(segment: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(segment.as_bytes())).into_owned()
}

/// Map one control request onto the orchestrator.
pub async fn handle_request(orchestrator: &LifecycleOrchestrator, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<String> = path.trim_matches('/').split('/').map(decode_segment).collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, ["api", "routes"]) => json(StatusCode::OK, &RouteList { routes: orchestrator.list_routes().await }),
        (&Method::GET, ["api", "routes", name]) => match orchestrator.get_route(name).await {
            Some(status) => json(StatusCode::OK, &status),
            None => failure(&RelayError::NotFound(name.to_string())),
        },
        (&Method::GET, ["api", "listeners"]) => json(StatusCode::OK, &ListenerList { listeners: orchestrator.list_active().await }),
        (&Method::POST, ["api", "routes"]) => match read_definition(req).await {
            Ok(definition) => outcome(orchestrator.add_route(definition).await),
            Err(e) => failure(&e),
        },
        (&Method::PUT, ["api", "routes", name]) => match read_definition(req).await {
            Ok(definition) => outcome(orchestrator.update_route(name, definition).await),
            Err(e) => failure(&e),
        },
        (&Method::DELETE, ["api", "routes", name]) => outcome(orchestrator.remove_route(name).await),
        (&Method::POST, ["api", "routes", name, "toggle"]) => outcome(orchestrator.toggle_route(name).await),
        (&Method::POST, ["api", "restart"]) => json(StatusCode::OK, &ControlResponse::ok(orchestrator.restart().await)),
        _ => json(StatusCode::NOT_FOUND, &ControlResponse::failed(format!("No such endpoint: {} {}", method, path))),
    }
}

async fn read_definition(req: Request<Body>) -> RelayResult<RouteDefinition> {
    let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|e| RelayError::malformed(format!("Failed to read request body: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| RelayError::malformed(format!("Invalid route definition: {}", e)))
}

fn outcome(result: RelayResult<String>) -> Response<Body> {
    match result {
        Ok(message) => json(StatusCode::OK, &ControlResponse::ok(message)),
        Err(e) => failure(&e),
    }
}

fn failure(e: &RelayError) -> Response<Body> {
    warn!("Control request failed: {}", e);
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json(status, &ControlResponse::from(e))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let mut response = match serde_json::to_vec(value) {
        Ok(body) => Response::new(Body::from(body)),
        Err(e) => {
            error!("Failed to serialize control response: {}", e);
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }
    };
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::route::RouteStatus;
    use crate::test_support::{free_tcp_port, spawn_tcp_echo};
    use std::time::Duration;

    fn engine() -> LifecycleOrchestrator {
        LifecycleOrchestrator::new(Duration::from_secs(30), Arc::new(MemoryStore::default()))
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn route_body(name: &str, listen_port: u16, forward_port: u16, enabled: bool) -> String {
        serde_json::json!({
            "name": name,
            "protocol": "tcp",
            "listen": { "host": "127.0.0.1", "port": listen_port },
            "forward": { "host": "127.0.0.1", "port": forward_port },
            "enabled": enabled
        })
        .to_string()
    }

    #[test]
    fn test_decode_segment() {
        assert_eq!(decode_segment("web"), "web");
        assert_eq!(decode_segment("my%20route"), "my route");
        assert_eq!(decode_segment("a%2Fb"), "a/b");
        assert_eq!(decode_segment("dns%20%C3%BCber"), "dns über");
        assert_eq!(decode_segment("%FF"), "\u{FFFD}");
    }

    #[tokio::test]
    async fn test_add_list_and_remove() {
        let engine = engine();
        let backend = spawn_tcp_echo().await;

        let response = handle_request(&engine, request(Method::POST, "/api/routes", &route_body("my route", free_tcp_port(), backend.port(), true))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);

        let response = handle_request(&engine, request(Method::GET, "/api/routes", "")).await;
        let list: RouteList = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(list.routes.len(), 1);
        assert!(list.routes[0].active);

        let response = handle_request(&engine, request(Method::GET, "/api/routes/my%20route", "")).await;
        let status: RouteStatus = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(status.route.name.as_deref(), Some("my route"));

        let response = handle_request(&engine, request(Method::GET, "/api/listeners", "")).await;
        let listeners: ListenerList = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(listeners.listeners.len(), 1);

        let response = handle_request(&engine, request(Method::DELETE, "/api/routes/my%20route", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(engine.list_routes().await.is_empty());
        assert!(engine.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_failures_map_to_status_codes() {
        let engine = engine();

        let response = handle_request(&engine, request(Method::POST, "/api/routes", "{ not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["success"], false);

        let response = handle_request(&engine, request(Method::POST, "/api/routes", r#"{"name":"x","protocol":"tcp"}"#)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = handle_request(&engine, request(Method::POST, "/api/routes/ghost/toggle", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handle_request(&engine, request(Method::PUT, "/api/routes/ghost", &route_body("ghost", 9000, 9001, false))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        handle_request(&engine, request(Method::POST, "/api/routes", &route_body("dup", 9000, 9001, false))).await;
        let response = handle_request(&engine, request(Method::POST, "/api/routes", &route_body("dup", 9002, 9003, false))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = handle_request(&engine, request(Method::GET, "/api/nothing", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_toggle_and_restart() {
        let engine = engine();
        handle_request(&engine, request(Method::POST, "/api/routes", &route_body("web", 9000, 9001, false))).await;

        let response = handle_request(&engine, request(Method::PUT, "/api/routes/web", &route_body("renamed", 9100, 9101, false))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let route = engine.get_route("web").await.unwrap().route;
        assert_eq!(route.listen.unwrap().port, 9100);

        let response = handle_request(&engine, request(Method::POST, "/api/routes/web/toggle", "")).await;
        assert_eq!(body_json(response).await["success"], true);
        assert_eq!(engine.get_route("web").await.unwrap().route.enabled, Some(true));

        let response = handle_request(&engine, request(Method::POST, "/api/restart", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);
        engine.stop_all().await;
    }
}
