//! # Agent Registry
//!
//! Tracks every live agent connection. Each entry maps an agent id to the
//! unbounded sender feeding that connection's outbound WebSocket task, so
//! any part of the controller can push a frame to an agent without touching
//! the socket itself.
//!
//! The registry owns only the id → handle mapping; the connection owns its
//! socket. Both drop their side on close, with the connection id guarding
//! against an old connection evicting its replacement.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use taskforge_protocol::{WsMessage, CLOSE_SUPERSEDED, CLOSE_UNREGISTERED};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// An instruction for a connection's outbound task.
#[derive(Debug)]
pub enum Outbound {
    /// Serialize and send a protocol frame.
    Frame(WsMessage),
    /// Send a close frame with the given code and reason, then stop.
    Close(u16, String),
}

/// Sender half of a connection's outbound queue.
///
/// Frames pushed through one sender are delivered in order (per-agent FIFO).
pub type AgentTx = mpsc::UnboundedSender<Outbound>;

struct AgentEntry {
    tx: AgentTx,
    conn_id: Uuid,
    last_seen: DateTime<Utc>,
}

/// Why a send to an agent did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// No registry entry for the agent id.
    Offline,
    /// The entry exists but its connection has gone away.
    ChannelClosed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Offline => f.write_str("agent is offline"),
            SendError::ChannelClosed => f.write_str("agent connection is closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Process-wide registry of live agent connections.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, AgentEntry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `id`. A stale entry for the same agent is
    /// overwritten (last writer wins) and its connection is closed with
    /// code 4005.
    pub fn register(&self, id: &str, conn_id: Uuid, tx: AgentTx) {
        if let Some(old) = self.agents.insert(
            id.to_string(),
            AgentEntry {
                tx,
                conn_id,
                last_seen: Utc::now(),
            },
        ) {
            info!(agent_id = %id, "superseding previous connection");
            let _ = old
                .tx
                .send(Outbound::Close(CLOSE_SUPERSEDED, "superseded".into()));
        }
    }

    /// Administrative removal: drops the entry and closes the connection
    /// with code 4006 if it is still open.
    pub fn unregister(&self, id: &str) -> bool {
        match self.agents.remove(id) {
            Some((_, entry)) => {
                let _ = entry.tx.send(Outbound::Close(
                    CLOSE_UNREGISTERED,
                    "unregistered by administrator".into(),
                ));
                true
            }
            None => false,
        }
    }

    /// Connection-scoped removal used during socket cleanup. Removes the
    /// entry only if it still belongs to `conn_id`, so a superseded
    /// connection cannot evict its successor.
    pub fn unregister_conn(&self, id: &str, conn_id: Uuid) -> bool {
        self.agents
            .remove_if(id, |_, entry| entry.conn_id == conn_id)
            .is_some()
    }

    /// True iff an entry exists and its connection can still accept frames.
    pub fn is_online(&self, id: &str) -> bool {
        self.agents
            .get(id)
            .map(|entry| !entry.tx.is_closed())
            .unwrap_or(false)
    }

    /// Queues a frame for delivery to `id`. Frames queued through two
    /// successful sends are delivered in order.
    pub fn send(&self, id: &str, frame: WsMessage) -> Result<(), SendError> {
        let entry = self.agents.get(id).ok_or(SendError::Offline)?;
        entry
            .tx
            .send(Outbound::Frame(frame))
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Snapshot of currently online agent ids.
    pub fn list_active(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|entry| !entry.tx.is_closed())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Refreshes the in-memory last-seen instant for `id`.
    pub fn touch(&self, id: &str) {
        if let Some(mut entry) = self.agents.get_mut(id) {
            entry.last_seen = Utc::now();
        }
    }

    /// Last-seen instant for `id`, if connected.
    pub fn last_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.agents.get(id).map(|entry| entry.last_seen)
    }

    /// Closes every connection with the given code. Used during shutdown.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in self.agents.iter() {
            debug!(agent_id = %entry.key(), "closing connection");
            let _ = entry
                .tx
                .send(Outbound::Close(code, reason.to_string()));
        }
        self.agents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_protocol::CLOSE_NORMAL;

    fn channel() -> (AgentTx, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn register_and_send() {
        let registry = AgentRegistry::new();
        let (tx, mut rx) = channel();
        registry.register("a1", Uuid::new_v4(), tx);

        assert!(registry.is_online("a1"));
        assert!(registry.send("a1", WsMessage::Ping).is_ok());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Frame(WsMessage::Ping)
        ));
    }

    #[test]
    fn send_to_unknown_agent_is_offline() {
        let registry = AgentRegistry::new();
        assert_eq!(registry.send("ghost", WsMessage::Ping), Err(SendError::Offline));
        assert!(!registry.is_online("ghost"));
    }

    #[test]
    fn register_supersedes_previous_connection() {
        let registry = AgentRegistry::new();
        let (old_tx, mut old_rx) = channel();
        let old_conn = Uuid::new_v4();
        registry.register("a1", old_conn, old_tx);

        let (new_tx, _new_rx) = channel();
        let new_conn = Uuid::new_v4();
        registry.register("a1", new_conn, new_tx);

        match old_rx.try_recv().unwrap() {
            Outbound::Close(code, _) => assert_eq!(code, CLOSE_SUPERSEDED),
            other => panic!("expected close, got {other:?}"),
        }

        // The superseded connection's cleanup must not evict the new one.
        assert!(!registry.unregister_conn("a1", old_conn));
        assert!(registry.is_online("a1"));
        assert!(registry.unregister_conn("a1", new_conn));
        assert!(!registry.is_online("a1"));
    }

    #[test]
    fn unregister_closes_with_4006() {
        let registry = AgentRegistry::new();
        let (tx, mut rx) = channel();
        registry.register("a1", Uuid::new_v4(), tx);

        assert!(registry.unregister("a1"));
        match rx.try_recv().unwrap() {
            Outbound::Close(code, _) => assert_eq!(code, CLOSE_UNREGISTERED),
            other => panic!("expected close, got {other:?}"),
        }
        assert!(!registry.unregister("a1"));
    }

    #[test]
    fn list_active_skips_closed_channels() {
        let registry = AgentRegistry::new();
        let (tx1, _rx1) = channel();
        registry.register("a1", Uuid::new_v4(), tx1);

        let (tx2, rx2) = channel();
        registry.register("a2", Uuid::new_v4(), tx2);
        drop(rx2);

        let active = registry.list_active();
        assert_eq!(active, vec!["a1".to_string()]);
        assert!(!registry.is_online("a2"));
    }

    #[test]
    fn close_all_empties_the_registry() {
        let registry = AgentRegistry::new();
        let (tx, mut rx) = channel();
        registry.register("a1", Uuid::new_v4(), tx);

        registry.close_all(CLOSE_NORMAL, "controller shutdown");
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close(1000, _)));
        assert!(registry.list_active().is_empty());
    }
}
