//! # Connection Gateway
//!
//! WebSocket entry point for agents. Each accepted connection goes through:
//!
//! 1. Pre-accept validation (denylist, identification header, `Origin`,
//!    per-IP attempt rate limit) — synchronous, before the upgrade
//! 2. Handshake — the first frame must be a valid `init` within 5 s
//! 3. Liveness — application ping every 30 s, pong deadline 10 s
//! 4. Message loop — rate-limited dispatch of `result` / `agent_error`
//! 5. Cleanup — registry removal, stored status, task manager hook

use crate::allowlist;
use crate::ratelimit::MessageWindow;
use crate::registry::Outbound;
use crate::state::AppState;
use crate::store::AgentStatus;
use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use taskforge_protocol::{
    WsMessage, CLOSE_BAD_HANDSHAKE, CLOSE_INVALID_FRAME, CLOSE_IP_REJECTED, CLOSE_NORMAL,
    CLOSE_UNAUTHORIZED, CLOSE_UNKNOWN_AGENT,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(10);
const MSG_RATE_WINDOW: Duration = Duration::from_secs(60);

/// `GET /ws` — upgrades the HTTP connection after pre-accept validation.
pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = peer.ip();

    if state.config.ip_denylist.contains(&ip) {
        warn!(%ip, "connection refused: denylisted peer");
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(required) = &state.config.ident_header {
        if !headers.contains_key(required.as_str()) {
            warn!(%ip, header = %required, "connection refused: missing identification header");
            return StatusCode::BAD_REQUEST.into_response();
        }
    }

    if !state.config.allowed_origins.is_empty() {
        if let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) {
            if !state.config.allowed_origins.iter().any(|o| o == origin) {
                warn!(%ip, origin, "connection refused: origin not allowed");
                return StatusCode::FORBIDDEN.into_response();
            }
        }
    }

    if !state.conn_limiter.check(ip) {
        warn!(%ip, "connection refused: attempt rate limit exceeded");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(socket, ip, state))
}

/// Sends a close frame during the handshake and drops the socket.
async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })))
        .await;
}

fn token_matches(provided: &str, secret: &str) -> bool {
    provided.as_bytes().ct_eq(secret.as_bytes()).into()
}

/// Full lifecycle of one agent connection, from handshake to cleanup.
async fn handle_connection(mut socket: WebSocket, ip: IpAddr, state: AppState) {
    let conn_id = Uuid::new_v4();

    // ── Handshake ──
    // The first frame, within 5 s, must be a valid `init`.
    let first = match timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(_) => return,
        Err(_) => {
            debug!(%ip, "handshake timed out");
            return reject(socket, CLOSE_BAD_HANDSHAKE, "handshake timeout").await;
        }
    };

    let (agent_id, auth_token) = match first {
        Message::Text(text) => match serde_json::from_str::<WsMessage>(&text) {
            Ok(WsMessage::Init {
                agent_id,
                auth_token,
            }) => (agent_id, auth_token),
            _ => return reject(socket, CLOSE_BAD_HANDSHAKE, "expected init frame").await,
        },
        Message::Close(_) => return,
        _ => return reject(socket, CLOSE_INVALID_FRAME, "expected a text frame").await,
    };

    let agent = match state.store.find_agent(&agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            warn!(%ip, agent_id, "handshake from unknown agent");
            return reject(socket, CLOSE_UNKNOWN_AGENT, "unknown agent").await;
        }
        Err(error) => {
            warn!(%ip, agent_id, %error, "agent lookup failed during handshake");
            return reject(socket, CLOSE_BAD_HANDSHAKE, "agent lookup failed").await;
        }
    };

    if !token_matches(&auth_token, &agent.secret) {
        warn!(%ip, agent_id, "handshake with bad token");
        return reject(socket, CLOSE_UNAUTHORIZED, "invalid token").await;
    }

    if !allowlist::ip_allowed(ip, &agent.allowed_ips) {
        warn!(%ip, agent_id, "peer address not in agent allow-list");
        return reject(socket, CLOSE_IP_REJECTED, "ip not allowed").await;
    }

    if let Err(error) = state
        .store
        .set_agent_status(&agent_id, AgentStatus::Online, Some(Utc::now()))
        .await
    {
        warn!(agent_id, %error, "failed to persist online status");
    }

    info!(agent_id, %ip, "agent connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    state.registry.register(&agent_id, conn_id, tx.clone());
    state.manager.on_agent_connect(&agent_id).await;

    // ── Outbound Task ──
    // Drains the queue and writes frames; a close instruction ends it.
    let outbound = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(error) => {
                            warn!(%error, "failed to serialize outbound frame");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code, reason) => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // ── Heartbeat Task ──
    // Application ping every 30 s; no pong within 10 s closes the link.
    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let heartbeat = tokio::spawn({
        let tx = tx.clone();
        let last_pong = Arc::clone(&last_pong);
        let agent_id = agent_id.clone();
        async move {
            loop {
                tokio::time::sleep(PING_INTERVAL).await;
                let ping_sent = Instant::now();
                if tx.send(Outbound::Frame(WsMessage::Ping)).is_err() {
                    break;
                }
                tokio::time::sleep(PONG_DEADLINE).await;
                if *last_pong.lock().unwrap() < ping_sent {
                    warn!(agent_id, "heartbeat timeout, terminating connection");
                    let _ = tx.send(Outbound::Close(CLOSE_NORMAL, "heartbeat timeout".into()));
                    break;
                }
            }
        }
    });

    // ── Inbound Loop ──
    let mut window = MessageWindow::new(state.config.msg_rate_limit, MSG_RATE_WINDOW);
    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            Message::Text(text) => {
                if !window.allow() {
                    warn!(agent_id, "inbound message rate exceeded, dropping frame");
                    continue;
                }
                state.registry.touch(&agent_id);

                match serde_json::from_str::<WsMessage>(&text) {
                    Ok(WsMessage::TaskResult { payload }) => {
                        state.manager.on_result(&agent_id, payload).await;
                    }
                    Ok(WsMessage::AgentError { payload }) => {
                        warn!(agent_id, level = %payload.level, error = %payload.error, "agent reported an error");
                        state.notifier.notify_error_report(&agent_id, &payload).await;
                    }
                    Ok(WsMessage::Ping) => {
                        let _ = tx.send(Outbound::Frame(WsMessage::Pong));
                    }
                    Ok(WsMessage::Pong) => {
                        *last_pong.lock().unwrap() = Instant::now();
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(agent_id, %error, "ignoring unreadable frame");
                    }
                }
            }
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; native pings are
            // answered by the WebSocket layer itself.
            _ => {}
        }
    }

    // ── Cleanup ──
    heartbeat.abort();
    outbound.abort();

    // A superseded connection no longer owns the registry entry; only the
    // current owner may flip the stored status or fail in-flight runs.
    let was_registered = state.registry.unregister_conn(&agent_id, conn_id);

    if was_registered && !state.shutdown.load(Ordering::SeqCst) {
        if let Err(error) = state
            .store
            .set_agent_status(&agent_id, AgentStatus::Offline, None)
            .await
        {
            warn!(agent_id, %error, "failed to persist offline status");
        }
        state.manager.on_agent_disconnect(&agent_id).await;
    }

    info!(agent_id, "agent disconnected");
}
