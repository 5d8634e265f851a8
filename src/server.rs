//! HTTP and WebSocket surface
//!
//! - `GET /api/state`: current snapshot, gzip above 500 bytes, ETag revalidation
//! - `GET /ws`: subscription channel
//! - `GET /health`, `GET /metrics`
//! - `POST /api/annotation`: operator control plane, mounted only when an
//!   admin token is configured

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, ETAG, IF_NONE_MATCH},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::compression::{predicate::SizeAbove, CompressionLayer};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::context::AppContext;
use crate::error::{AppError, SendError};
use crate::heartbeat::{PING, PONG};
use crate::registry::Subscriber;
use crate::snapshot::content_checksum;

/// Bodies at or below this size are sent uncompressed.
const COMPRESSION_MIN_BYTES: u16 = 500;

pub fn create_router(ctx: AppContext) -> Router {
    let mut router = Router::new()
        .route(
            "/api/state",
            get(get_state)
                .layer(CompressionLayer::new().compress_when(SizeAbove::new(COMPRESSION_MIN_BYTES))),
        )
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics));

    if ctx.config.admin_token.is_some() {
        router = router.route("/api/annotation", post(set_annotation));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').map(str::trim).any(|t| t == etag || t == "*"))
}

async fn get_state(State(ctx): State<AppContext>, headers: HeaderMap) -> Result<Response, AppError> {
    let bytes = ctx.cache.get_snapshot_bytes().await?;
    let etag = format!("\"{}\"", content_checksum(&bytes));

    if etag_matches(&headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, [(ETAG, etag)]).into_response());
    }
    Ok((
        [
            (CONTENT_TYPE, "application/json".to_string()),
            (ETAG, etag),
        ],
        bytes,
    )
        .into_response())
}

async fn health(State(ctx): State<AppContext>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "subscribers": ctx.registry.count(),
    }))
}

async fn metrics(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.metrics.export())
}

#[derive(Debug, Deserialize)]
pub struct AnnotationRequest {
    pub text: String,
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn authorize(ctx: &AppContext, headers: &HeaderMap) -> Result<(), AppError> {
    let expected = ctx
        .config
        .admin_token
        .as_deref()
        .ok_or_else(|| AppError::Unauthorized("annotation endpoint disabled".into()))?;
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;

    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AppError::Unauthorized("invalid token".into()))
    }
}

async fn set_annotation(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(req): Json<AnnotationRequest>,
) -> Result<Json<Value>, AppError> {
    authorize(&ctx, &headers)?;
    if !ctx.set_annotation(&req.text) {
        return Err(AppError::BadRequest("annotation text must not be empty".into()));
    }
    info!(len = req.text.len(), "Annotation updated");
    Ok(Json(json!({ "status": "ok" })))
}

/// Write half of one subscriber socket.
struct WsSubscriber {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    /// Fired once the registry no longer holds this subscriber.
    detached: CancellationToken,
}

impl WsSubscriber {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            detached: CancellationToken::new(),
        }
    }

    /// Send within `limit`. Any failure ends the session.
    async fn send_within(&self, payload: Bytes, limit: Duration) -> bool {
        matches!(timeout(limit, self.send(payload)).await, Ok(Ok(())))
    }

    async fn close(&self, code: u16, reason: &'static str, limit: Duration) {
        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        };
        let close = async { self.sink.lock().await.send(Message::Close(Some(frame))).await };
        let _ = timeout(limit, close).await;
    }
}

#[async_trait]
impl Subscriber for WsSubscriber {
    async fn send(&self, payload: Bytes) -> Result<(), SendError> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(payload))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))
    }

    fn detach(&self) {
        self.detached.cancel();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

fn is_ping(msg: &Message) -> bool {
    match msg {
        Message::Text(text) => text.as_str() == "ping",
        Message::Binary(data) => data.as_ref() == b"ping",
        _ => false,
    }
}

async fn handle_socket(socket: WebSocket, ctx: AppContext) {
    let (sink, mut stream) = socket.split();
    let subscriber = Arc::new(WsSubscriber::new(sink));
    let send_timeout = ctx.config.send_timeout;

    let id = match ctx.registry.connect(subscriber.clone()) {
        Ok(id) => id,
        Err(_) => {
            subscriber
                .close(close_code::AGAIN, "Too many connections", send_timeout)
                .await;
            return;
        }
    };

    let initial = match ctx.cache.get_snapshot_bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(subscriber_id = id, error = %e, "Failed to build initial snapshot");
            ctx.registry.disconnect(id);
            return;
        }
    };

    if subscriber.send_within(initial, send_timeout).await {
        loop {
            tokio::select! {
                _ = subscriber.detached.cancelled() => {
                    debug!(subscriber_id = id, "Subscriber evicted, closing socket");
                    subscriber.close(close_code::AWAY, "Evicted", send_timeout).await;
                    break;
                }
                read = timeout(ctx.config.idle_timeout, stream.next()) => match read {
                    Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) | Ok(None) => break,
                    Ok(Some(Ok(msg))) => {
                        if is_ping(&msg)
                            && !subscriber.send_within(Bytes::from_static(PONG), send_timeout).await
                        {
                            break;
                        }
                    }
                    Err(_) => {
                        // Silent client; check it is still there.
                        if !subscriber.send_within(Bytes::from_static(PING), send_timeout).await {
                            break;
                        }
                    }
                },
            }
        }
    }

    debug!(subscriber_id = id, "Subscriber socket closed");
    ctx.registry.disconnect(id);
}
