//! # Controller Connection Loop
//!
//! Maintains the persistent WebSocket connection to the controller:
//! - connect, send the `init` handshake, process orders
//! - reconnect with exponential backoff (1 s doubling, capped at 30 s)
//! - answer controller pings with pongs
//! - report unreadable frames with `agent_error`
//!
//! The executor outlives connections, so a script started before an
//! outage keeps running; only its result delivery is lost.

use crate::config::AgentConfig;
use crate::executor::Executor;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use taskforge_protocol::{ErrorReportPayload, WsMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Reconnect delay: 1 s base doubled per consecutive failure, 30 s cap.
fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(5);
    Duration::from_secs((1u64 << exp).min(30))
}

/// Runs the connection loop forever.
pub async fn run_agent_loop(config: Arc<AgentConfig>, executor: Arc<Executor>) {
    let mut failures: u32 = 0;
    loop {
        info!(url = %config.controller_url, "connecting to controller");
        match connect_async(config.controller_url.as_str()).await {
            Ok((ws, _)) => {
                failures = 0;
                info!("connected");

                let (mut sink, mut stream) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

                // First frame: identify and authenticate.
                let _ = tx.send(WsMessage::Init {
                    agent_id: config.agent_id.clone(),
                    auth_token: config.auth_token.clone(),
                });

                // ── Outbound Sender Task ──
                let outbound = tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        let Ok(text) = serde_json::to_string(&msg) else {
                            continue;
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                });

                // ── Inbound Loop ──
                while let Some(Ok(frame)) = stream.next().await {
                    match frame {
                        Message::Text(text) => {
                            handle_frame(&executor, &tx, text.as_str()).await;
                        }
                        Message::Close(close) => {
                            if let Some(close) = close {
                                warn!(
                                    code = u16::from(close.code),
                                    reason = %close.reason,
                                    "controller closed the connection"
                                );
                            }
                            break;
                        }
                        _ => {}
                    }
                }

                outbound.abort();
                warn!("disconnected from controller");
            }
            Err(err) => {
                error!(error = %err, "connection failed");
            }
        }

        failures += 1;
        let delay = backoff_delay(failures);
        info!(delay_secs = delay.as_secs(), "reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn handle_frame(
    executor: &Arc<Executor>,
    tx: &mpsc::UnboundedSender<WsMessage>,
    text: &str,
) {
    match serde_json::from_str::<WsMessage>(text) {
        Ok(WsMessage::ExecuteTask { payload }) => {
            // Each execution gets its own task so long scripts never block
            // the message loop.
            let executor = Arc::clone(executor);
            let tx = tx.clone();
            tokio::spawn(async move {
                executor.execute(payload, tx).await;
            });
        }
        Ok(WsMessage::CancelTask { payload }) => {
            if !executor.cancel(payload.task_id) {
                debug!(task_id = payload.task_id, "cancel order for idle task");
            }
        }
        Ok(WsMessage::Ping) => {
            let _ = tx.send(WsMessage::Pong);
        }
        Ok(WsMessage::Pong) => {}
        Ok(_) => {}
        Err(err) => {
            warn!(error = %err, "unreadable frame from controller");
            let _ = tx.send(WsMessage::AgentError {
                payload: ErrorReportPayload {
                    level: "warn".into(),
                    error: format!("unreadable frame: {err}"),
                    timestamp: Utc::now(),
                },
            });
        }
    }
}
