use crate::app::fanout::{ClientEvent, SessionRegistry};
use futures_util::StreamExt;
use parley_storage::PresenceBus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Message carried on the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub username: String,
    pub presence: String,
    pub last_seen: Option<i64>,
    pub partners: Vec<String>,
}

impl PresenceUpdate {
    pub fn client_event(&self) -> ClientEvent {
        ClientEvent::new(
            "presence_update",
            json!({
                "username": self.username,
                "presence": self.presence,
                "last_seen": self.last_seen,
            }),
        )
    }
}

/// Forwards every update on `channel` to the partners with a session here.
pub fn spawn_relay(
    bus: Arc<dyn PresenceBus>,
    channel: String,
    sessions: Arc<SessionRegistry>,
    retry_delay: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !shutdown.is_cancelled() {
            let mut updates = match bus.subscribe(&channel).await {
                Ok(updates) => updates,
                Err(err) => {
                    warn!(channel = %channel, error = %err, "presence subscription failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(retry_delay) => continue,
                    }
                }
            };
            info!(channel = %channel, "presence relay subscribed");
            loop {
                let payload = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    payload = updates.next() => payload,
                };
                let Some(payload) = payload else {
                    warn!(channel = %channel, "presence subscription ended; resubscribing");
                    break;
                };
                relay(&sessions, &payload).await;
            }
        }
    })
}

pub async fn relay(sessions: &SessionRegistry, payload: &str) -> usize {
    let update = match serde_json::from_str::<PresenceUpdate>(payload) {
        Ok(update) => update,
        Err(err) => {
            warn!(error = %err, "malformed presence update");
            return 0;
        }
    };
    let delivered = sessions
        .broadcast(&update.partners, &update.client_event())
        .await;
    debug!(user = %update.username, delivered, "presence relayed");
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use parley_storage::MemoryStore;

    #[tokio::test]
    async fn updates_reach_local_partners_only() {
        let sessions = Arc::new(SessionRegistry::new(8, Arc::new(Metrics::new())));
        let mut bob = sessions.register("bob", "s1").await;
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let task = spawn_relay(
            store.clone(),
            "presence_updates".to_string(),
            sessions.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        let update = PresenceUpdate {
            username: "alice".to_string(),
            presence: "online".to_string(),
            last_seen: None,
            partners: vec!["bob".to_string(), "carol".to_string()],
        };
        store
            .publish("presence_updates", &serde_json::to_string(&update).unwrap())
            .await
            .unwrap();
        let payload = bob.recv().await.unwrap();
        assert!(payload.contains("\"presence_update\""));
        assert!(payload.contains("\"alice\""));
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_updates_are_ignored() {
        let sessions = SessionRegistry::new(8, Arc::new(Metrics::new()));
        assert_eq!(relay(&sessions, "not json").await, 0);
    }
}
