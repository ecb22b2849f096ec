use crate::app::AppState;
use crate::app::fanout::ClientEvent;
use parley_events::StreamEntryId;
use parley_mirror::{MirrorRecord, TerminalStatus};
use parley_storage::{StorageError, keys};
use serde_json::json;
use tracing::{debug, info, warn};

/// Pending "has everyone acknowledged this message" question for one
/// progress key.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceCheck {
    pub group_id: String,
    pub message_id: String,
    pub status: TerminalStatus,
    /// Latest acknowledgement timestamp folded into this check.
    pub at: i64,
    pub entry_id: StreamEntryId,
    pub redelivered: bool,
}

impl ConvergenceCheck {
    pub fn absorb(&mut self, other: ConvergenceCheck) {
        self.at = self.at.max(other.at);
        self.entry_id = self.entry_id.max(other.entry_id);
        self.redelivered |= other.redelivered;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Nothing changed and the entry was not a redelivery.
    Skipped,
    Waiting { acknowledged: usize, roster: usize },
    Fired { notified: usize },
}

/// Runs after the progress key's mutations. Failures are logged and never
/// fail the batch.
pub async fn evaluate(
    state: &AppState,
    progress_key: &str,
    check: &ConvergenceCheck,
    added: usize,
) -> Verdict {
    match try_evaluate(state, progress_key, check, added).await {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(
                group = %check.group_id,
                message_id = %check.message_id,
                status = %check.status,
                error = %err,
                "convergence check failed"
            );
            Verdict::Skipped
        }
    }
}

async fn try_evaluate(
    state: &AppState,
    progress_key: &str,
    check: &ConvergenceCheck,
    added: usize,
) -> Result<Verdict, StorageError> {
    if added == 0 && !check.redelivered {
        return Ok(Verdict::Skipped);
    }
    let roster_key = keys::group_members(&check.group_id);
    let roster = state.cache.set_cardinality(&roster_key).await?;
    let acknowledged = state.cache.ordered_cardinality(progress_key).await?;
    // the sender never acknowledges its own message
    if roster == 0 || acknowledged + 1 != roster {
        debug!(
            group = %check.group_id,
            message_id = %check.message_id,
            acknowledged,
            roster,
            "convergence not reached"
        );
        return Ok(Verdict::Waiting {
            acknowledged,
            roster,
        });
    }

    state
        .cache
        .set_fields(
            &keys::message_status(&check.message_id),
            &[(check.status.as_str().to_string(), check.at.to_string())],
        )
        .await?;
    let members = state.cache.set_members(&roster_key).await?;
    let event = ClientEvent::new(
        match check.status {
            TerminalStatus::Delivered => "group_message_delivered",
            TerminalStatus::Read => "group_message_read",
        },
        json!({
            "group_id": check.group_id,
            "message_id": check.message_id,
            "status": check.status,
            "at": check.at,
        }),
    );
    let notified = state.sessions.broadcast(&members, &event).await;
    state.mirror.enqueue(MirrorRecord {
        message_id: check.message_id.clone(),
        status: check.status,
        status_at: check.at,
        entry_id: check.entry_id,
    });
    state.metrics.mark_convergence();
    info!(
        group = %check.group_id,
        message_id = %check.message_id,
        status = %check.status,
        roster,
        notified,
        "group message converged"
    );
    Ok(Verdict::Fired { notified })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::memory_state;
    use parley_storage::CacheStore;

    fn check(redelivered: bool) -> ConvergenceCheck {
        ConvergenceCheck {
            group_id: "g".to_string(),
            message_id: "m".to_string(),
            status: TerminalStatus::Delivered,
            at: 1_700_000,
            entry_id: StreamEntryId::new(1700, 0),
            redelivered,
        }
    }

    async fn ack(state: &AppState, user: &str) -> usize {
        state
            .cache
            .ordered_add(
                &keys::delivered_to_users("g", "m"),
                &[(user.to_string(), 1_700_000.0)],
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fires_once_when_last_member_acknowledges() {
        let (state, store) = memory_state();
        let roster = ["s", "a", "b", "c"].map(String::from).to_vec();
        store.set_add(&keys::group_members("g"), &roster).await.unwrap();
        let mut inbox = state.sessions.register("s", "session-s").await;
        let progress = keys::delivered_to_users("g", "m");

        for user in ["a", "b"] {
            let added = ack(&state, user).await;
            let verdict = evaluate(&state, &progress, &check(false), added).await;
            assert!(matches!(verdict, Verdict::Waiting { roster: 4, .. }));
        }
        let added = ack(&state, "c").await;
        assert_eq!(
            evaluate(&state, &progress, &check(false), added).await,
            Verdict::Fired { notified: 1 }
        );
        let added = ack(&state, "c").await;
        assert_eq!(
            evaluate(&state, &progress, &check(false), added).await,
            Verdict::Skipped
        );

        assert_eq!(
            store
                .get_field(&keys::message_status("m"), "delivered")
                .await
                .unwrap()
                .as_deref(),
            Some("1700000")
        );
        let payload = inbox.recv().await.unwrap();
        assert!(payload.contains("\"event\":\"group_message_delivered\""));
        assert!(inbox.try_recv().is_err());
        assert_eq!(state.metrics.snapshot().convergence_fired, 1);
        assert_eq!(state.metrics.snapshot().mirror_enqueued, 1);
    }

    #[tokio::test]
    async fn redelivery_rechecks_without_new_members() {
        let (state, store) = memory_state();
        store
            .set_add(&keys::group_members("g"), &["s".to_string(), "a".to_string()])
            .await
            .unwrap();
        ack(&state, "a").await;
        let progress = keys::delivered_to_users("g", "m");
        assert_eq!(
            evaluate(&state, &progress, &check(true), 0).await,
            Verdict::Fired { notified: 0 }
        );
    }

    #[tokio::test]
    async fn empty_roster_never_fires() {
        let (state, _store) = memory_state();
        let progress = keys::delivered_to_users("g", "m");
        let added = ack(&state, "a").await;
        assert_eq!(
            evaluate(&state, &progress, &check(false), added).await,
            Verdict::Waiting {
                acknowledged: 1,
                roster: 0
            }
        );
    }

    #[test]
    fn checks_absorb_latest_ack() {
        let mut first = check(false);
        let mut second = check(true);
        second.at = 1_800_000;
        second.entry_id = StreamEntryId::new(1800, 0);
        first.absorb(second);
        assert_eq!(first.at, 1_800_000);
        assert_eq!(first.entry_id, StreamEntryId::new(1800, 0));
        assert!(first.redelivered);
    }
}
