//! HTTP router: the chat streaming endpoints (C9), the container inspection
//! API (C3/C6), and the preview proxy (C10), wired onto one `AppState`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::Request;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::containerization::ContainerizationService;
use crate::error::DaemonError;
use crate::preview::PreviewRouter;
use crate::stream::{ChatStreamRequest, StreamEvent, StreamProcessor};

#[derive(Clone)]
pub struct AppState {
    pub stream_processor: Arc<StreamProcessor>,
    pub containerization: Arc<ContainerizationService>,
    pub preview: Arc<PreviewRouter>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/stream/chat", post(start_chat_stream))
        .route("/api/stream/chat/:chat_id/cancel", post(cancel_chat_stream))
        .route("/api/containers/info", get(list_container_info))
        .route("/api/containers/info/:app_id", get(get_container_info))
        .route("/api/containers/ports", get(list_managed_ports))
        .route("/api/containers/:app_id/stop", post(stop_container))
        .route("/app/preview/:app_id/*tail", any(preview_proxy))
        .route("/app/preview/:app_id", any(preview_proxy_root))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// `POST /api/stream/chat` (§6): starts a stream and adapts its event
/// source into an SSE response body.
async fn start_chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatStreamRequest>,
) -> Sse<impl futures_util::Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let events = state.stream_processor.start(request);
    let sse_events = futures_util::StreamExt::map(events, |event: StreamEvent| Ok(event.into_sse()));
    Sse::new(sse_events).keep_alive(KeepAlive::default())
}

async fn cancel_chat_stream(State(state): State<AppState>, Path(chat_id): Path<u64>) -> impl IntoResponse {
    let canceled = state.stream_processor.cancel(chat_id);
    Json(serde_json::json!({ "canceled": canceled }))
}

async fn list_container_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.containerization.get_service_status().await)
}

async fn get_container_info(State(state): State<AppState>, Path(app_id): Path<u64>) -> impl IntoResponse {
    Json(state.containerization.get_container_status(app_id).await)
}

async fn list_managed_ports(State(state): State<AppState>) -> impl IntoResponse {
    let handler = state.containerization.current_engine_handler().await;
    match handler.list_managed_ports(None).await {
        Ok(ports) => Json(serde_json::json!({ "ports": ports })).into_response(),
        Err(e) => DaemonError::from(e).into_response(),
    }
}

async fn stop_container(State(state): State<AppState>, Path(app_id): Path<u64>) -> impl IntoResponse {
    Json(state.containerization.stop_container(app_id).await)
}

async fn preview_proxy(State(state): State<AppState>, Path((app_id, tail)): Path<(u64, String)>, req: Request<axum::body::Body>) -> Response {
    let query = req.uri().query().map(|q| format!("?{}", q)).unwrap_or_default();
    state.preview.handle(app_id, &format!("/{}{}", tail, query), req).await
}

async fn preview_proxy_root(State(state): State<AppState>, Path(app_id): Path<u64>, req: Request<axum::body::Body>) -> Response {
    let query = req.uri().query().map(|q| format!("?{}", q)).unwrap_or_default();
    state.preview.handle(app_id, &format!("/{}", query), req).await
}
