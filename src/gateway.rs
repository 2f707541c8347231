//! Client channel binding.
//!
//! Accepts WebSocket connections, authenticates, and wires one session, one
//! frame pump, and one message router loop per client. A slow client only
//! ever blocks itself: its commands run on its own reader loop and its frames
//! queue behind its own pump.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::browser::Viewport;
use crate::config::Config;
use crate::fabric::CircuitBreaker;
use crate::memory::MemoryGovernor;
use crate::pump::{FrameAcker, FrameRecord, StreamPump};
use crate::router::MessageRouter;
use crate::session::SessionManager;
use crate::wire::{OutboundChannel, OutboundPayload, ServerMessage};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const DEAD_PEER_INTERVAL: Duration = Duration::from_secs(45);
/// Liveness pings are skipped while this much outbound data is in flight.
const PING_SKIP_BUFFER: usize = 1024 * 1024;
/// Pause before re-binding the frame stream after it ends.
const REBIND_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    Missing,
    #[error("rejected token")]
    Rejected,
}

pub struct Principal {
    pub subject: String,
}

/// Token verification seam. The gateway never inspects tokens itself.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Default policy: any non-empty token is accepted and becomes the subject.
pub struct AcceptNonEmpty;

#[async_trait]
impl Authenticator for AcceptNonEmpty {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            Err(AuthError::Missing)
        } else {
            Ok(Principal {
                subject: token.to_string(),
            })
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub governor: Arc<MemoryGovernor>,
    pub router: Arc<MessageRouter>,
    pub create_breaker: Arc<CircuitBreaker>,
    pub authenticator: Arc<dyn Authenticator>,
    pub active: Arc<StdMutex<HashSet<String>>>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let breaker = state.create_breaker.state();
    let active = state.active.lock().expect("active set lock poisoned").len();
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "activeConnections": active,
        "circuitBreaker": {
            "isOpen": breaker.is_open,
            "failures": breaker.failures,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token = params
        .get("token")
        .cloned()
        .or_else(|| auth.map(|TypedHeader(a)| a.token().to_string()));
    ws.on_upgrade(move |socket| handle_socket(socket, token, state))
}

async fn handle_socket(mut socket: WebSocket, token: Option<String>, state: AppState) {
    // One auth error message, then the channel closes.
    let principal = match token {
        Some(token) => state.authenticator.authenticate(&token).await,
        None => Err(AuthError::Missing),
    };
    if let Err(e) = principal {
        tracing::warn!(error = %e, "rejecting unauthenticated channel");
        if let Ok(text) = serde_json::to_string(&ServerMessage::auth_error(e.to_string())) {
            let _ = socket.send(Message::Text(text)).await;
        }
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let client_id = Uuid::new_v4().to_string();
    state
        .active
        .lock()
        .expect("active set lock poisoned")
        .insert(client_id.clone());
    tracing::info!(client_id, "client connected");

    let (sink, mut stream) = socket.split();
    let (channel, rx) = OutboundChannel::new();
    let conn_token = CancellationToken::new();
    let pong_seen = Arc::new(AtomicBool::new(true));

    let writer = tokio::spawn(writer_task(sink, rx, channel.clone(), conn_token.clone()));
    let dead_peer = tokio::spawn(dead_peer_task(
        Arc::clone(&pong_seen),
        conn_token.clone(),
        client_id.clone(),
    ));

    channel.send(&ServerMessage::Connected {
        client_id: client_id.clone(),
    });

    // Session creation runs through the gateway's breaker so a flapping
    // browser host sheds connect attempts instead of stacking them.
    let created = state
        .create_breaker
        .run(state.sessions.create(&client_id, Viewport::default()))
        .await;
    let streamer = match created {
        Ok(_session) => {
            state.sessions.attach_channel(&client_id, channel.clone());
            channel.send(&ServerMessage::SessionReady);
            Some(tokio::spawn(stream_frames(
                state.clone(),
                client_id.clone(),
                channel.clone(),
            )))
        }
        Err(e) => {
            tracing::error!(client_id, error = %e, "session create failed, closing channel");
            channel.send(&ServerMessage::connection_error(e.to_string()));
            conn_token.cancel();
            None
        }
    };

    if streamer.is_some() {
        loop {
            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            state.router.dispatch(&client_id, &text, &channel).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            pong_seen.store(true, Ordering::SeqCst);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(client_id, error = %e, "websocket receive error");
                            break;
                        }
                    }
                }
                () = conn_token.cancelled() => break,
                () = state.shutdown.cancelled() => break,
            }
        }
    }

    // Teardown: timers first, then handles, then registries.
    conn_token.cancel();
    channel.mark_closed();
    if let Some(task) = streamer {
        task.abort();
    }
    dead_peer.abort();
    let _ = writer.await;

    state.sessions.cleanup(&client_id, true).await;
    state.governor.clear_client(&client_id);
    state
        .active
        .lock()
        .expect("active set lock poisoned")
        .remove(&client_id);
    tracing::info!(client_id, "client disconnected");
}

/// Owns the socket sink: forwards outbound payloads, emits liveness pings,
/// and closes the socket when the connection token fires.
async fn writer_task(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<OutboundPayload>,
    channel: OutboundChannel,
    conn_token: CancellationToken,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // immediate first tick

    loop {
        tokio::select! {
            // Pending payloads (including a final error) drain before the
            // cancellation branch is taken.
            biased;
            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                if sink.send(Message::Text(payload.text)).await.is_err() {
                    channel.mark_closed();
                    break;
                }
                channel.settle(payload.bytes);
            }
            _ = ping.tick() => {
                if channel.buffered_bytes() > PING_SKIP_BUFFER {
                    continue;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    channel.mark_closed();
                    break;
                }
            }
            () = conn_token.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    channel.mark_closed();
}

/// Closes the connection when a whole check interval passes without a pong.
async fn dead_peer_task(pong_seen: Arc<AtomicBool>, conn_token: CancellationToken, client_id: String) {
    let mut interval = tokio::time::interval(DEAD_PEER_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        if !pong_seen.swap(false, Ordering::SeqCst) {
            tracing::warn!(client_id, "no pong since previous check, closing dead peer");
            conn_token.cancel();
            break;
        }
    }
}

/// Bind the session's screencast to the client channel.
///
/// Runs for the life of the connection. When the frame stream ends (page
/// closed during recovery, browser loss), it re-resolves the session and
/// binds again, so a recovered session resumes streaming without the client
/// doing anything.
async fn stream_frames(state: AppState, client_id: String, channel: OutboundChannel) {
    while channel.is_open() {
        let Some(session) = state.sessions.get(&client_id).await else {
            tracing::warn!(client_id, "no session to stream from");
            break;
        };

        if let Err(e) = state.sessions.start_screencast(&session).await {
            tracing::warn!(client_id, error = %e, "screencast start failed");
            tokio::time::sleep(REBIND_DELAY).await;
            continue;
        }

        let acker: Arc<dyn FrameAcker> = Arc::new(session.cdp.clone());
        let pump = StreamPump::new(
            client_id.clone(),
            channel.clone(),
            acker,
            session.health.flag(),
        );
        state.governor.register_client(&client_id, pump.queue_handle());

        let mut frames = match session.cdp.frames().await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(client_id, error = %e, "frame subscription failed");
                tokio::time::sleep(REBIND_DELAY).await;
                continue;
            }
        };

        tracing::info!(client_id, "screencast bound");
        while let Some(event) = frames.next().await {
            let record = FrameRecord {
                data: event.data.clone().into(),
                session_id: event.session_id,
            };
            pump.on_frame(record).await;
        }

        tracing::info!(client_id, "frame stream ended, rebinding");
        tokio::time::sleep(REBIND_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserDriver;

    fn test_state() -> AppState {
        let config = Arc::new(Config::from_env());
        let driver = BrowserDriver::new(config.browser.clone());
        let sessions = SessionManager::new(driver, Arc::clone(&config));
        let router = Arc::new(MessageRouter::new(Arc::clone(&sessions), Arc::clone(&config)));
        let governor = MemoryGovernor::new(config.memory.clone());
        AppState {
            create_breaker: Arc::new(CircuitBreaker::new(
                config.circuit.threshold,
                config.circuit.reset_timeout,
            )),
            config,
            sessions,
            governor,
            router,
            authenticator: Arc::new(AcceptNonEmpty),
            active: Arc::new(StdMutex::new(HashSet::new())),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn health_reports_shape() {
        let state = test_state();
        state.active.lock().unwrap().insert("c1".to_string());

        let Json(body) = health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeConnections"], 1);
        assert_eq!(body["circuitBreaker"]["isOpen"], false);
        assert_eq!(body["circuitBreaker"]["failures"], 0);
        assert!(body["timestamp"].as_str().is_some());
        assert!(body["uptimeSeconds"].as_u64().is_some());
    }

    #[tokio::test]
    async fn accept_non_empty_policy() {
        let auth = AcceptNonEmpty;
        assert!(auth.authenticate("").await.is_err());
        let principal = auth.authenticate("tok-123").await.unwrap();
        assert_eq!(principal.subject, "tok-123");
    }
}
