//! Identity merging.
//!
//! When an `identify` record links an anonymous id to an authenticated user,
//! the anonymous id's history is absorbed into that user's [`MergedIdentity`].
//! Absorbing a new member rebuilds the combined aggregate by replaying the
//! union of all member histories in sequence order, so the result does not
//! depend on how each standalone aggregate happened to be built.
//!
//! Once absorbed, an anonymous id is owned by exactly one merged identity and
//! all of its later records fold into the combined aggregate.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use sightline_core::RawRecord;

use crate::reduce::{self, Aggregate};

/// An authenticated user and the anonymous ids merged into it.
#[derive(Debug, Clone, Serialize)]
pub struct MergedIdentity {
    pub user_id: String,
    pub members: BTreeSet<String>,
    /// Raw records of every member, in arrival order.
    #[serde(skip)]
    history: Vec<Arc<RawRecord>>,
    pub aggregate: Aggregate,
}

impl MergedIdentity {
    fn rebuild(&mut self) -> bool {
        match reduce::replay(&self.history) {
            Some(aggregate) => {
                self.aggregate = aggregate;
                true
            }
            None => false,
        }
    }
}

/// What [`MergeEngine::link`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// A new merged identity was created for the user.
    Created,
    /// The anonymous id joined an existing identity and its history was replayed.
    Replayed,
    /// The anonymous id was already a member; nothing to do.
    AlreadyMember,
    /// The anonymous id moved here from another user's identity.
    Relinked { previous_user_id: String },
    /// The history held nothing foldable.
    Empty,
}

/// How a member record was folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Folded onto the end of the combined aggregate.
    Incremental,
    /// Arrived behind the aggregate's latest sequence number; history replayed.
    Replayed,
}

/// Owner of every merged identity and of the anonymous-id ownership map.
#[derive(Debug, Default)]
pub struct MergeEngine {
    identities: HashMap<String, MergedIdentity>,
    absorbed: HashMap<String, String>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The user whose merged identity owns `anonymous_id`, if any.
    pub fn owner_of(&self, anonymous_id: &str) -> Option<&str> {
        self.absorbed.get(anonymous_id).map(String::as_str)
    }

    pub fn is_absorbed(&self, anonymous_id: &str) -> bool {
        self.absorbed.contains_key(anonymous_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&MergedIdentity> {
        self.identities.get(user_id)
    }

    pub fn identities(&self) -> impl Iterator<Item = &MergedIdentity> {
        self.identities.values()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Link `anonymous_id` to `user_id`.
    ///
    /// `history` is the anonymous id's full record history and must already
    /// include the linking record.
    pub fn link(
        &mut self,
        user_id: &str,
        anonymous_id: &str,
        history: &[Arc<RawRecord>],
    ) -> LinkOutcome {
        let previous_user_id = match self.owner_of(anonymous_id) {
            Some(owner) if owner == user_id => return LinkOutcome::AlreadyMember,
            Some(owner) => Some(owner.to_string()),
            None => None,
        };

        if let Some(previous) = &previous_user_id {
            self.detach(previous, anonymous_id);
        }

        let outcome = match self.identities.get_mut(user_id) {
            Some(identity) => {
                identity.members.insert(anonymous_id.to_string());
                identity.history.extend(history.iter().cloned());
                if !identity.rebuild() {
                    return LinkOutcome::Empty;
                }
                metrics::counter!("merge_replays_total").increment(1);
                LinkOutcome::Replayed
            }
            None => {
                let history = history.to_vec();
                let Some(aggregate) = reduce::replay(&history) else {
                    return LinkOutcome::Empty;
                };
                self.identities.insert(
                    user_id.to_string(),
                    MergedIdentity {
                        user_id: user_id.to_string(),
                        members: BTreeSet::from([anonymous_id.to_string()]),
                        history,
                        aggregate,
                    },
                );
                LinkOutcome::Created
            }
        };

        self.absorbed
            .insert(anonymous_id.to_string(), user_id.to_string());
        metrics::counter!("merge_identities_linked_total").increment(1);

        tracing::debug!(
            user_id,
            anonymous_id,
            outcome = ?outcome,
            "linked anonymous id"
        );

        match previous_user_id {
            Some(previous_user_id) => LinkOutcome::Relinked { previous_user_id },
            None => outcome,
        }
    }

    /// Fold a record from an absorbed anonymous id into its owner's aggregate.
    ///
    /// Returns `None` if the record's anonymous id is not absorbed.
    pub fn fold_member(
        &mut self,
        record: &Arc<RawRecord>,
    ) -> Option<sightline_core::Result<FoldOutcome>> {
        let owner = self.absorbed.get(&record.event.anonymous_id)?;
        let identity = self.identities.get_mut(owner)?;

        identity.history.push(Arc::clone(record));

        if identity.aggregate.accepts_in_order(record) {
            Some(identity.aggregate.apply(record).map(|()| FoldOutcome::Incremental))
        } else {
            identity.rebuild();
            metrics::counter!("merge_replays_total").increment(1);
            Some(Ok(FoldOutcome::Replayed))
        }
    }

    /// Remove `anonymous_id` from `user_id`'s identity, dropping the identity
    /// if no members remain.
    fn detach(&mut self, user_id: &str, anonymous_id: &str) {
        self.absorbed.remove(anonymous_id);

        let Some(identity) = self.identities.get_mut(user_id) else {
            return;
        };
        identity.members.remove(anonymous_id);
        identity
            .history
            .retain(|r| r.event.anonymous_id != anonymous_id);

        if identity.members.is_empty() || !identity.rebuild() {
            self.identities.remove(user_id);
            tracing::debug!(user_id, "dropped merged identity with no members");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::record;

    fn history(records: &[Arc<RawRecord>]) -> Vec<Arc<RawRecord>> {
        records.to_vec()
    }

    #[test]
    fn test_link_creates_identity() {
        let mut engine = MergeEngine::new();
        let a1 = history(&[
            record(1, "a1", r#""type":"track","event":"complete search","properties":{"lat":1,"lng":2}"#),
            record(2, "a1", r#""type":"identify","userId":"u1""#),
        ]);

        assert_eq!(engine.link("u1", "a1", &a1), LinkOutcome::Created);
        assert_eq!(engine.owner_of("a1"), Some("u1"));

        let identity = engine.get("u1").unwrap();
        assert_eq!(identity.aggregate.consolidated_id, "u1");
        assert_eq!(identity.aggregate.event_count, 2);
        assert!(identity.aggregate.is_searching());
        assert_eq!(engine.link("u1", "a1", &a1), LinkOutcome::AlreadyMember);
    }

    #[test]
    fn test_second_member_triggers_replay_in_sequence_order() {
        let mut engine = MergeEngine::new();
        let a1 = history(&[
            record(1, "a1", r#""type":"track","event":"first""#),
            record(4, "a1", r#""type":"identify","userId":"u1""#),
        ]);
        let a2 = history(&[
            record(2, "a2", r#""type":"track","event":"second""#),
            record(3, "a2", r#""type":"track","event":"third""#),
            record(5, "a2", r#""type":"identify","userId":"u1""#),
        ]);

        engine.link("u1", "a1", &a1);
        assert_eq!(engine.link("u1", "a2", &a2), LinkOutcome::Replayed);

        let identity = engine.get("u1").unwrap();
        assert_eq!(
            identity.aggregate.event_names,
            vec!["first", "second", "third", "identify", "identify"]
        );
        assert_eq!(identity.members.len(), 2);

        let union: Vec<_> = a1.iter().chain(a2.iter()).collect();
        assert_eq!(identity.aggregate, reduce::replay(union).unwrap());
    }

    #[test]
    fn test_fold_member_incremental_and_out_of_order() {
        let mut engine = MergeEngine::new();
        engine.link("u1", "a1", &[record(5, "a1", r#""type":"identify","userId":"u1""#)]);

        let next = record(6, "a1", r#""type":"track","event":"later""#);
        assert_eq!(
            engine.fold_member(&next).unwrap().unwrap(),
            FoldOutcome::Incremental
        );

        let behind = record(3, "a1", r#""type":"track","event":"earlier""#);
        assert_eq!(
            engine.fold_member(&behind).unwrap().unwrap(),
            FoldOutcome::Replayed
        );
        assert_eq!(
            engine.get("u1").unwrap().aggregate.event_names,
            vec!["earlier", "identify", "later"]
        );

        let stranger = record(7, "zz", r#""type":"track""#);
        assert!(engine.fold_member(&stranger).is_none());
    }

    #[test]
    fn test_relink_moves_member() {
        let mut engine = MergeEngine::new();
        let a1 = history(&[record(1, "a1", r#""type":"identify","userId":"u1""#)]);
        let a2 = history(&[record(2, "a2", r#""type":"identify","userId":"u1""#)]);
        engine.link("u1", "a1", &a1);
        engine.link("u1", "a2", &a2);

        let mut a2_again = a2.clone();
        a2_again.push(record(3, "a2", r#""type":"identify","userId":"u2""#));
        assert_eq!(
            engine.link("u2", "a2", &a2_again),
            LinkOutcome::Relinked {
                previous_user_id: "u1".to_string()
            }
        );

        assert_eq!(engine.owner_of("a2"), Some("u2"));
        let u1 = engine.get("u1").unwrap();
        assert_eq!(u1.members, BTreeSet::from(["a1".to_string()]));
        assert_eq!(u1.aggregate.event_count, 1);
        assert_eq!(engine.get("u2").unwrap().aggregate.consolidated_id, "u2");
    }

    #[test]
    fn test_relink_drops_empty_identity() {
        let mut engine = MergeEngine::new();
        let a1 = history(&[record(1, "a1", r#""type":"identify","userId":"u1""#)]);
        engine.link("u1", "a1", &a1);

        let mut moved = a1.clone();
        moved.push(record(2, "a1", r#""type":"identify","userId":"u2""#));
        engine.link("u2", "a1", &moved);

        assert!(engine.get("u1").is_none());
        assert_eq!(engine.len(), 1);
    }
}
