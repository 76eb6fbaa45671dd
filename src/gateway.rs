//! HTTP front door: event submission, subscription queries, health.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use relay_core::{Event, IngestOutcome, Rejection, RelayMessage, Subscription};
use serde::Serialize;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::rate_limit::ClientRateLimiter;
use crate::relay::Relay;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub limiter: Option<Arc<ClientRateLimiter>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: i64,
}

/// Routes plus the rate-limit, body limit and request timeout layers.
///
/// `from_fn` middleware only accepts plain `Request<Body>`, so the rate limit
/// goes first. The timeout stays inside the body limit: it needs a `Default`
/// response body, which the limit's body type lacks.
pub fn router(state: AppState, server: &ServerConfig) -> Router {
    let timeout = Duration::from_secs(server.request_timeout_secs);
    Router::new()
        .route("/new_event", post(handle_new_event))
        .route("/subscription", post(handle_subscription))
        .route("/health", get(handle_health))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
                .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
                .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)),
        )
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Gateway listening on {}", addr);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .with_context(|| "Gateway server error")
}

/// HTTP status for a submission outcome.
pub fn outcome_status(outcome: &IngestOutcome) -> StatusCode {
    match outcome {
        IngestOutcome::Accepted(_) => StatusCode::OK,
        IngestOutcome::Rejected(Rejection::BadSignature | Rejection::IdMismatch) => StatusCode::UNAUTHORIZED,
        IngestOutcome::Rejected(Rejection::Duplicate) => StatusCode::CONFLICT,
        IngestOutcome::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_new_event(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<RelayMessage>) {
    let event: Event = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            debug!("Malformed event body: {}", e);
            let ack = RelayMessage::Ok {
                event_id: String::new(),
                accepted: false,
                message: format!("invalid: malformed event: {}", e),
            };
            return (StatusCode::BAD_REQUEST, Json(ack));
        }
    };

    let id = event.id.clone();
    let outcome = state.relay.pipeline.ingest(event).await;
    (outcome_status(&outcome), Json(outcome.ack(&id)))
}

async fn handle_subscription(State(state): State<AppState>, body: Bytes) -> Response {
    let subscription: Subscription = match serde_json::from_slice(&body) {
        Ok(subscription) => subscription,
        Err(e) => {
            debug!("Malformed subscription body: {}", e);
            let notice = RelayMessage::notice(format!("invalid: malformed subscription: {}", e));
            return (StatusCode::BAD_REQUEST, Json(notice)).into_response();
        }
    };

    match state.relay.engine.subscribe(&subscription).await {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(e) => {
            error!("Subscription {} failed: {}", subscription.id, e);
            let notice = RelayMessage::notice("error: could not load events");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(notice)).into_response()
        }
    }
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        time: chrono::Utc::now().timestamp(),
    })
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(limiter) = &state.limiter else {
        return next.run(request).await;
    };
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0));
    let client = limiter.client_ip(request.headers(), peer);
    if !limiter.check(client) {
        let notice = RelayMessage::notice("rate-limited: slow down");
        return (StatusCode::TOO_MANY_REQUESTS, Json(notice)).into_response();
    }
    next.run(request).await
}
