use crate::metrics::Metrics;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

/// Event as written to a client session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientEvent {
    pub event: &'static str,
    pub data: Value,
}

impl ClientEvent {
    pub fn new(event: &'static str, data: Value) -> Self {
        Self { event, data }
    }
}

pub struct SessionEntry {
    pub sender: mpsc::Sender<String>,
    pub session_id: String,
}

/// Username to live session handle; the most recent registration wins.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    buffer: usize,
    metrics: Arc<Metrics>,
}

impl SessionRegistry {
    pub fn new(buffer: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            metrics,
        }
    }

    /// Installs a session for `username`, replacing any previous one.
    pub async fn register(&self, username: &str, session_id: &str) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let previous = self.sessions.write().await.insert(
            username.to_string(),
            SessionEntry {
                sender,
                session_id: session_id.to_string(),
            },
        );
        if let Some(previous) = previous {
            info!(user = username, replaced = %previous.session_id, session = session_id, "session replaced");
        }
        receiver
    }

    /// Removes the handle only while it still belongs to `session_id`.
    pub async fn unregister(&self, username: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(username) {
            Some(entry) if entry.session_id == session_id => {
                sessions.remove(username);
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, username: &str) -> bool {
        self.sessions.read().await.contains_key(username)
    }

    /// Serializes and writes `event`; a missing session is a no-op.
    pub async fn send(&self, username: &str, event: &ClientEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(_) => return false,
        };
        self.deliver(username, payload).await
    }

    /// Returns how many recipients had a live session that accepted the event.
    pub async fn broadcast(&self, usernames: &[String], event: &ClientEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(_) => return 0,
        };
        let mut delivered = 0;
        for username in usernames {
            if self.deliver(username, payload.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    async fn deliver(&self, username: &str, payload: String) -> bool {
        let sender = {
            let sessions = self.sessions.read().await;
            match sessions.get(username) {
                Some(entry) => entry.sender.clone(),
                None => return false,
            }
        };
        match sender.try_send(payload) {
            Ok(()) => {
                self.metrics.mark_fanout_sent();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.mark_fanout_dropped();
                debug!(user = username, "session buffer full; event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.mark_fanout_dropped();
                debug!(user = username, "session closed; event dropped");
                false
            }
        }
    }
}
