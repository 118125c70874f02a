//! C10: on-demand start plus HTTP/WebSocket reverse proxy keyed by
//! workspace id (§4.7). Concurrent preview requests for the same workspace
//! coalesce on `Lifecycle.MarkStarting` rather than each racing to start a
//! container.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::containerization::ContainerizationService;
use crate::data::WorkspaceRepository;

/// Grace period after starting a container before the dev server is assumed
/// to accept connections (§4.7 step 2).
const START_GRACE: Duration = Duration::from_secs(3);
/// Bound on how long a concurrent preview request waits for another
/// caller's in-flight start before giving up (§4.7 concurrency note).
const START_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

const HOP_BY_HOP: &[&str] = &["connection", "upgrade", "proxy-authenticate", "proxy-authorization", "te", "trailer", "transfer-encoding"];

pub struct PreviewRouter {
    containerization: Arc<ContainerizationService>,
    workspaces: Arc<dyn WorkspaceRepository>,
    http_client: reqwest::Client,
}

impl PreviewRouter {
    pub fn new(containerization: Arc<ContainerizationService>, workspaces: Arc<dyn WorkspaceRepository>) -> Self {
        Self { containerization, workspaces, http_client: reqwest::Client::new() }
    }

    /// Serves one request under `/app/preview/{appId}/**`. `tail` is
    /// everything after the workspace id segment, including any query
    /// string.
    pub async fn handle(&self, app_id: u64, tail: &str, req: Request<Body>) -> Response {
        self.containerization.lifecycle().record_activity(app_id);

        let port = match self.ensure_running(app_id).await {
            Ok(port) => port,
            Err(response) => return response,
        };

        if is_websocket_upgrade(req.headers()) {
            self.proxy_websocket(port, tail, req).await
        } else {
            self.proxy_http(port, tail, req).await
        }
    }

    /// Ensures `app_id`'s container is running and returns its published
    /// port, starting it on demand (§4.7 steps 1-3).
    async fn ensure_running(&self, app_id: u64) -> Result<u16, Response> {
        let handler = self.containerization.current_engine_handler().await;
        let running = handler.is_container_running(app_id).await.unwrap_or(false);

        if !running {
            let lifecycle = self.containerization.lifecycle().clone();
            if lifecycle.mark_starting(app_id).await {
                let result = self.start_for_preview(app_id).await;
                lifecycle.mark_started(app_id).await;
                result?;
            } else {
                // Another request is already starting this workspace;
                // coalesce by waiting for it rather than racing a second start.
                let deadline = tokio::time::Instant::now() + START_WAIT_TIMEOUT;
                while lifecycle.is_starting(app_id).await {
                    if tokio::time::Instant::now() >= deadline {
                        return Err((StatusCode::GATEWAY_TIMEOUT, "timed out waiting for container start").into_response());
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        match self.containerization.lifecycle().get_port(app_id) {
            Some(port) => Ok(port),
            None => {
                // Fall back to the engine's live mapping if our own map
                // missed it (e.g. a container discovered but never recorded).
                let status = self.containerization.get_container_status(app_id).await;
                status
                    .data
                    .as_ref()
                    .and_then(|d| d.get("port"))
                    .and_then(|v| v.as_u64())
                    .map(|p| p as u16)
                    .ok_or_else(|| (StatusCode::BAD_GATEWAY, "no port allocated for workspace").into_response())
            }
        }
    }

    async fn start_for_preview(&self, app_id: u64) -> Result<(), Response> {
        let workspace = self
            .workspaces
            .get(app_id)
            .await
            .ok_or_else(|| (StatusCode::NOT_FOUND, "workspace not found").into_response())?;

        let handler = self.containerization.current_engine_handler().await;
        if handler.container_exists(app_id).await.unwrap_or(false) && !handler.is_container_running(app_id).await.unwrap_or(false) {
            debug!(app_id, "removing stopped container shadow before restart");
            let _ = self.containerization.remove_container(app_id, false).await;
            self.containerization.lifecycle().release_port(app_id);
        }

        let port = self
            .containerization
            .lifecycle()
            .allocate_port(app_id, true, handler.as_ref())
            .await
            .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response())?;

        let result = self.containerization.run_container(app_id, &workspace.path, port, false, false).await;
        if !result.success {
            return Err((StatusCode::GATEWAY_TIMEOUT, result.error.unwrap_or(result.message)).into_response());
        }

        info!(app_id, port, "started container for preview request");
        tokio::time::sleep(START_GRACE).await;
        Ok(())
    }

    async fn proxy_http(&self, port: u16, tail: &str, req: Request<Body>) -> Response {
        let (parts, body) = req.into_parts();
        let url = format!("http://127.0.0.1:{}{}", port, tail);

        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => return (StatusCode::BAD_GATEWAY, format!("failed reading request body: {}", e)).into_response(),
        };

        let mut outbound = self.http_client.request(parts.method.clone(), &url).body(body_bytes.to_vec());
        for (name, value) in parts.headers.iter() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            outbound = outbound.header(name, value);
        }

        match outbound.send().await {
            Ok(upstream) => {
                let status = upstream.status();
                let mut response_headers = HeaderMap::new();
                for (name, value) in upstream.headers().iter() {
                    if !HOP_BY_HOP.contains(&name.as_str()) {
                        if let (Ok(name), Ok(value)) =
                            (HeaderName::from_bytes(name.as_str().as_bytes()), HeaderValue::from_bytes(value.as_bytes()))
                        {
                            response_headers.insert(name, value);
                        }
                    }
                }
                let stream = upstream.bytes_stream();
                let mut response = Response::new(Body::from_stream(stream));
                *response.status_mut() = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
                *response.headers_mut() = response_headers;
                response
            }
            Err(e) => {
                warn!(port, error = %e, "preview upstream request failed");
                (StatusCode::BAD_GATEWAY, format!("upstream error: {}", e)).into_response()
            }
        }
    }

    async fn proxy_websocket(&self, port: u16, tail: &str, req: Request<Body>) -> Response {
        let url = format!("ws://127.0.0.1:{}{}", port, tail);
        let (mut parts, _body) = req.into_parts();
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(e) => return e.into_response(),
        };

        upgrade.on_upgrade(move |client_socket| async move {
            match tokio_tungstenite::connect_async(&url).await {
                Ok((backend_socket, _)) => pump_websocket(client_socket, backend_socket).await,
                Err(e) => warn!(url, error = %e, "failed to open backend websocket for hot reload"),
            }
        })
    }
}

/// Bidirectional copy loop between the browser's upgraded socket and the
/// dev server's websocket, cancelled as soon as either side closes (§9).
async fn pump_websocket(
    client: axum::extract::ws::WebSocket,
    backend: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let client_to_backend = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                axum::extract::ws::Message::Text(t) => WsMessage::Text(t),
                axum::extract::ws::Message::Binary(b) => WsMessage::Binary(b),
                axum::extract::ws::Message::Ping(p) => WsMessage::Ping(p),
                axum::extract::ws::Message::Pong(p) => WsMessage::Pong(p),
                axum::extract::ws::Message::Close(_) => break,
            };
            if backend_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = backend_tx.close().await;
    };

    let backend_to_client = async {
        while let Some(Ok(msg)) = backend_rx.next().await {
            let forwarded = match msg {
                WsMessage::Text(t) => axum::extract::ws::Message::Text(t),
                WsMessage::Binary(b) => axum::extract::ws::Message::Binary(b),
                WsMessage::Ping(p) => axum::extract::ws::Message::Ping(p),
                WsMessage::Pong(p) => axum::extract::ws::Message::Pong(p),
                WsMessage::Close(_) | WsMessage::Frame(_) => break,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(client_to_backend, backend_to_client);
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn detects_websocket_upgrade_header() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));

        let plain = HeaderMap::new();
        assert!(!is_websocket_upgrade(&plain));
    }
}
