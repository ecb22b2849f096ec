//! Projection strategies, one per event kind.
//!
//! A strategy turns a decoded batch into a [`ProjectionPlan`]: cache
//! mutations grouped by key, convergence checks attached to the key whose
//! mutation they follow, and effects that run once the whole batch has been
//! projected.

pub mod direct;
pub mod group;
pub mod users;

use crate::app::convergence::ConvergenceCheck;
use crate::app::fanout::ClientEvent;
use parley_events::{ChatKind, StreamEntryId, StreamEvent, score, sub_score};
use parley_mirror::MirrorRecord;
use parley_storage::{CacheStore, StorageError, keys};
use std::collections::BTreeMap;

/// Successfully decoded entry of a batch.
#[derive(Debug, Clone)]
pub struct Decoded<E> {
    pub id: StreamEntryId,
    pub redelivered: bool,
    pub event: E,
}

pub trait Projection: Send + Sync + 'static {
    type Event: StreamEvent;

    fn plan(&self, batch: &[Decoded<Self::Event>], plan: &mut ProjectionPlan);
}

/// Single cache call against one key.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    SetFields(Vec<(String, String)>),
    DeleteFields(Vec<String>),
    OrderedAdd(Vec<(String, f64)>),
    OrderedRaise(Vec<(String, f64)>),
    OrderedRemove(Vec<String>),
    SetAdd(Vec<String>),
    SetRemove(Vec<String>),
    /// Drops `che_id` from the history of every member of the recipient set
    /// at the key, then empties the set.
    Retract {
        kind: ChatKind,
        chat: String,
        che_id: String,
    },
}

impl Mutation {
    /// Folds `next` into `self` when both are the same kind of call.
    fn merge(&mut self, next: Mutation) -> Result<(), Mutation> {
        match (self, next) {
            (Mutation::SetFields(current), Mutation::SetFields(more)) => current.extend(more),
            (Mutation::DeleteFields(current), Mutation::DeleteFields(more)) => current.extend(more),
            (Mutation::OrderedAdd(current), Mutation::OrderedAdd(more)) => current.extend(more),
            (Mutation::OrderedRaise(current), Mutation::OrderedRaise(more)) => current.extend(more),
            (Mutation::OrderedRemove(current), Mutation::OrderedRemove(more)) => {
                current.extend(more)
            }
            (Mutation::SetAdd(current), Mutation::SetAdd(more)) => current.extend(more),
            (Mutation::SetRemove(current), Mutation::SetRemove(more)) => current.extend(more),
            (_, next) => return Err(next),
        }
        Ok(())
    }

    /// Returns the number of ordered-set members the call created.
    pub async fn apply(&self, cache: &dyn CacheStore, key: &str) -> Result<usize, StorageError> {
        match self {
            Mutation::SetFields(fields) => cache.set_fields(key, fields).await.map(|_| 0),
            Mutation::DeleteFields(fields) => cache.delete_fields(key, fields).await.map(|_| 0),
            Mutation::OrderedAdd(members) => cache.ordered_add(key, members).await,
            Mutation::OrderedRaise(members) => cache.ordered_raise(key, members).await,
            Mutation::OrderedRemove(members) => cache.ordered_remove(key, members).await.map(|_| 0),
            Mutation::SetAdd(members) => cache.set_add(key, members).await.map(|_| 0),
            Mutation::SetRemove(members) => cache.set_remove(key, members).await.map(|_| 0),
            Mutation::Retract { kind, chat, che_id } => {
                let recipients = cache.set_members(key).await?;
                if recipients.is_empty() {
                    return Ok(0);
                }
                let che = [che_id.clone()];
                for recipient in &recipients {
                    cache
                        .ordered_remove(&keys::history(*kind, recipient, chat), &che)
                        .await?;
                }
                cache.set_remove(key, &recipients).await.map(|_| 0)
            }
        }
    }
}

/// Everything one key task does, in receipt order.
#[derive(Debug, Default)]
pub struct KeyedWork {
    pub mutations: Vec<Mutation>,
    pub convergence: Option<ConvergenceCheck>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Notify {
        recipients: Vec<String>,
        event: ClientEvent,
    },
    Mirror(MirrorRecord),
    PublishPresence(String),
}

#[derive(Debug, Default)]
pub struct ProjectionPlan {
    keyed: BTreeMap<String, KeyedWork>,
    effects: Vec<Effect>,
}

impl ProjectionPlan {
    pub fn set_field(&mut self, key: impl Into<String>, field: impl Into<String>, value: String) {
        self.push(key.into(), Mutation::SetFields(vec![(field.into(), value)]));
    }

    pub fn delete_field(&mut self, key: impl Into<String>, field: impl Into<String>) {
        self.push(key.into(), Mutation::DeleteFields(vec![field.into()]));
    }

    pub fn ordered_add(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) {
        self.push(key.into(), Mutation::OrderedAdd(vec![(member.into(), score)]));
    }

    pub fn ordered_raise(&mut self, key: impl Into<String>, member: impl Into<String>, score: f64) {
        self.push(key.into(), Mutation::OrderedRaise(vec![(member.into(), score)]));
    }

    pub fn ordered_remove(&mut self, key: impl Into<String>, member: impl Into<String>) {
        self.push(key.into(), Mutation::OrderedRemove(vec![member.into()]));
    }

    pub fn set_add(&mut self, key: impl Into<String>, members: Vec<String>) {
        if !members.is_empty() {
            self.push(key.into(), Mutation::SetAdd(members));
        }
    }

    pub fn set_remove(&mut self, key: impl Into<String>, members: Vec<String>) {
        if !members.is_empty() {
            self.push(key.into(), Mutation::SetRemove(members));
        }
    }

    /// Retracts `che_id` from every history recorded under `recipients_key`.
    pub fn retract(
        &mut self,
        recipients_key: impl Into<String>,
        kind: ChatKind,
        chat: impl Into<String>,
        che_id: impl Into<String>,
    ) {
        self.push(
            recipients_key.into(),
            Mutation::Retract {
                kind,
                chat: chat.into(),
                che_id: che_id.into(),
            },
        );
    }

    /// Attaches a convergence check to the progress key; checks on the same
    /// key collapse into one.
    pub fn converge(&mut self, key: impl Into<String>, check: ConvergenceCheck) {
        let work = self.keyed.entry(key.into()).or_default();
        match work.convergence.as_mut() {
            Some(existing) => existing.absorb(check),
            None => work.convergence = Some(check),
        }
    }

    pub fn notify(&mut self, recipients: Vec<String>, event: ClientEvent) {
        if !recipients.is_empty() {
            self.effects.push(Effect::Notify { recipients, event });
        }
    }

    pub fn mirror(&mut self, record: MirrorRecord) {
        self.effects.push(Effect::Mirror(record));
    }

    pub fn publish_presence(&mut self, payload: String) {
        self.effects.push(Effect::PublishPresence(payload));
    }

    pub fn keyed(&self) -> &BTreeMap<String, KeyedWork> {
        &self.keyed
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn into_parts(self) -> (BTreeMap<String, KeyedWork>, Vec<Effect>) {
        (self.keyed, self.effects)
    }

    fn push(&mut self, key: String, mutation: Mutation) {
        let work = self.keyed.entry(key).or_default();
        let mutation = match work.mutations.last_mut() {
            Some(last) => match last.merge(mutation) {
                Ok(()) => return,
                Err(mutation) => mutation,
            },
            None => mutation,
        };
        work.mutations.push(mutation);
    }
}

/// Scores for the ordered sub-records one entry expands into.
pub(crate) fn activity_scores(id: &StreamEntryId, count: usize) -> Vec<f64> {
    // count was bounded by the fan-out limit at decode time
    (0..count)
        .map(|index| sub_score(id, index).unwrap_or_else(|_| score(id)))
        .collect()
}

/// Everyone in `members` except `excluded`.
pub(crate) fn others(members: &[String], excluded: &str) -> Vec<String> {
    members
        .iter()
        .filter(|member| member.as_str() != excluded)
        .cloned()
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_calls_on_a_key_merge() {
        let mut plan = ProjectionPlan::default();
        plan.ordered_add("h", "che-1", 1.0);
        plan.ordered_add("h", "che-2", 2.0);
        plan.ordered_remove("h", "che-0");
        plan.ordered_add("h", "che-3", 3.0);
        plan.set_field("users", "alice", "{}".to_string());
        let work = &plan.keyed()["h"];
        assert_eq!(
            work.mutations,
            vec![
                Mutation::OrderedAdd(vec![("che-1".to_string(), 1.0), ("che-2".to_string(), 2.0)]),
                Mutation::OrderedRemove(vec!["che-0".to_string()]),
                Mutation::OrderedAdd(vec![("che-3".to_string(), 3.0)]),
            ]
        );
        assert_eq!(plan.keyed().len(), 2);
    }

    #[test]
    fn empty_set_calls_are_skipped() {
        let mut plan = ProjectionPlan::default();
        plan.set_add("s", Vec::new());
        plan.notify(Vec::new(), ClientEvent::new("x", serde_json::Value::Null));
        assert!(plan.keyed().is_empty());
        assert!(plan.effects().is_empty());
    }

    #[test]
    fn activity_scores_increase_within_entry() {
        let id = StreamEntryId::new(1700, 0);
        let scores = activity_scores(&id, 3);
        assert!(scores.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(scores[2] < score(&StreamEntryId::new(1700, 1)));
    }
}
