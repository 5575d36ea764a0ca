//! Gateway routes: the SSE stream, message posting and router assembly.

use std::convert::Infallible;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio_stream::Stream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

use pipegate_core::GatewayConfig;

use super::AppState;
use super::error::ApiError;
use super::health::health;
use super::rate_limit::rate_limit;
use crate::relay::OpenedSession;
use crate::session::StreamEvent;

/// Query string of `POST /{command}/message`.
#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Build the gateway router.
///
/// `/health` is open; the stream and message routes sit behind the rate
/// limiter and carry the body size limit.
pub fn build_router(state: AppState, config: &GatewayConfig) -> Router {
    let api = Router::new()
        .route("/{command}/stream", get(stream))
        .route("/{command}/message", post(message))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(DefaultBodyLimit::max(config.max_body_bytes));

    let router = Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    match cors_layer(&config.cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return Some(layer.allow_origin(Any));
    }
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    Some(layer.allow_origin(AllowOrigin::list(list)))
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn to_sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Endpoint { session_id, path } => {
            Event::default().event("endpoint").id(session_id).data(path)
        }
        StreamEvent::Message(value) => Event::default().event("message").data(value.to_string()),
    }
}

/// `GET /{command}/stream`: open a session and stream worker output.
pub async fn stream(
    State(state): State<AppState>,
    Path(command): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let metadata = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)));
    let OpenedSession {
        session_id,
        mut events,
        disconnect,
        ..
    } = state
        .engine
        .open_session(authorization(&headers), &command, metadata)
        .await?;

    let events = async_stream::stream! {
        // Dropped with the response body when the client goes away.
        let _disconnect = disconnect;
        while let Some(event) = events.recv().await {
            yield Ok(to_sse_event(event));
        }
        debug!(session_id = %session_id, "Event stream ended");
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

/// `POST /{command}/message?sessionId=<id>`: relay one JSON message.
pub async fn message(
    State(state): State<AppState>,
    Path(command): Path<String>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .post_message(
            authorization(&headers),
            &command,
            query.session_id.as_deref(),
            &body,
        )
        .await?;
    Ok(StatusCode::ACCEPTED)
}
