//! Live service-event streams: SSE and WebSocket

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::Uri;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures_util::{SinkExt, Stream, StreamExt};
use std::convert::Infallible;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use registry_core::EventStream;

use crate::error::ApiError;
use crate::server::AppState;

/// `GET /api/v1/events/services/{serviceId}/stream` — one ServiceEvent per
/// SSE event, `text/event-stream`
pub async fn sse_stream(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    uri: Uri,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let watch = state
        .engine
        .discovery()
        .watch_service(&service_id)
        .map_err(|e| ApiError::from_registry(&e, uri.path()))?;
    info!(service_id = %service_id, "SSE watcher attached");

    let stream = futures_util::stream::unfold(watch, |mut watch| async move {
        loop {
            let event = watch.next().await?;
            let Ok(sse) = Event::default()
                .event(event.event_type.as_str())
                .json_data(&event)
            else {
                continue;
            };
            return Some((Ok(sse), watch));
        }
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /api/v1/events/health/stream` — probe verdicts as they land; a
/// separate feed from the service events
pub async fn health_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.engine.watch_health();
    let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let Ok(sse) = Event::default().event("HEALTH").json_data(&event) else {
                        continue;
                    };
                    return Some((Ok(sse), receiver));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /ws/services/{serviceId}/events` — the same payloads, JSON-framed
pub async fn websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let watch = state
        .engine
        .discovery()
        .watch_service(&service_id)
        .map_err(|e| ApiError::from_registry(&e, uri.path()))?;
    info!(service_id = %service_id, "WebSocket watcher attached");
    Ok(ws.on_upgrade(move |socket| forward_events(socket, watch, service_id)))
}

async fn forward_events(socket: WebSocket, mut watch: EventStream, service_id: String) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = watch.next() => {
                let Some(event) = event else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(service_id = %service_id, "WebSocket closed by client");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(service_id = %service_id, error = %error, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }
    if watch.dropped() > 0 {
        warn!(
            service_id = %service_id,
            dropped = watch.dropped(),
            "WebSocket watcher fell behind; oldest events were dropped"
        );
    }
    info!(service_id = %service_id, "WebSocket watcher detached");
}
