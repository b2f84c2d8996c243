//! Progress checkpointing
//!
//! A `Checkpoint` is the durable record separating "records that must end
//! up persisted" (`target_ids`) from "records already persisted"
//! (`saved_ids`). It is created once extraction completes, mutated
//! incrementally as batches commit, and kept forever for audit and
//! idempotence checks.
//!
//! Invariants, enforced by every mutating operation:
//! - `saved_ids` is always a subset of `target_ids`
//! - `saved_ids` never shrinks
//! - `target_ids` only grows, by merge

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::mapper::RecordId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The run this checkpoint belongs to
    pub log_id: Uuid,
    pub target_ids: BTreeSet<RecordId>,
    pub saved_ids: BTreeSet<RecordId>,
    /// Failure reasons for ids that could not be saved
    pub note: BTreeMap<RecordId, String>,
    pub done: bool,
}

impl Checkpoint {
    pub fn new(log_id: Uuid) -> Self {
        Self {
            log_id,
            target_ids: BTreeSet::new(),
            saved_ids: BTreeSet::new(),
            note: BTreeMap::new(),
            done: false,
        }
    }

    /// Merge newly discovered target ids; existing entries are unaffected
    pub fn merge_targets<I: IntoIterator<Item = RecordId>>(&mut self, ids: I) {
        self.target_ids.extend(ids);
    }

    /// Record ids as saved
    ///
    /// Ids outside `target_ids` are ignored rather than recorded, keeping
    /// the subset invariant under any caller.
    pub fn append_saved<'a, I: IntoIterator<Item = &'a RecordId>>(&mut self, ids: I) {
        for id in ids {
            if self.target_ids.contains(id) {
                self.saved_ids.insert(id.clone());
            }
        }
    }

    /// Attach a failure reason to ids that could not be saved
    pub fn annotate<'a, I: IntoIterator<Item = &'a RecordId>>(&mut self, ids: I, reason: &str) {
        for id in ids {
            self.note.insert(id.clone(), reason.to_string());
        }
    }

    /// Remove notes for ids that have since been saved
    pub fn clear_notes<'a, I: IntoIterator<Item = &'a RecordId>>(&mut self, ids: I) {
        for id in ids {
            self.note.remove(id);
        }
    }

    /// Target ids not yet saved, in deterministic order
    pub fn remaining(&self) -> Vec<RecordId> {
        self.target_ids.difference(&self.saved_ids).cloned().collect()
    }

    /// Whether every target id has been saved
    pub fn is_complete(&self) -> bool {
        self.saved_ids.len() == self.target_ids.len()
    }

    /// Mark the checkpoint done; only legal once complete
    pub fn mark_done(&mut self) {
        debug_assert!(self.is_complete());
        self.done = true;
    }

    /// The subset invariant, checked by tests and store implementations
    pub fn invariant_holds(&self) -> bool {
        self.saved_ids.is_subset(&self.target_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> RecordId {
        RecordId::from_natural_key([n.to_string().as_str()])
    }

    #[test]
    fn test_merge_and_append() {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4());
        checkpoint.merge_targets([id(1), id(2), id(3)]);
        assert_eq!(checkpoint.remaining().len(), 3);
        assert!(!checkpoint.is_complete());

        checkpoint.append_saved(&[id(1), id(2)]);
        assert_eq!(checkpoint.remaining(), vec![id(3)]);
        assert!(checkpoint.invariant_holds());

        checkpoint.append_saved(&[id(3)]);
        assert!(checkpoint.is_complete());
        checkpoint.mark_done();
        assert!(checkpoint.done);
    }

    #[test]
    fn test_append_outside_targets_is_ignored() {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4());
        checkpoint.merge_targets([id(1)]);

        checkpoint.append_saved(&[id(1), id(99)]);
        assert!(checkpoint.invariant_holds());
        assert_eq!(checkpoint.saved_ids.len(), 1);
    }

    #[test]
    fn test_merge_never_removes() {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4());
        checkpoint.merge_targets([id(1), id(2)]);
        checkpoint.append_saved(&[id(1)]);

        // Re-merging a smaller discovery set must not shrink anything
        checkpoint.merge_targets([id(2)]);
        assert_eq!(checkpoint.target_ids.len(), 2);
        assert_eq!(checkpoint.saved_ids.len(), 1);
    }

    #[test]
    fn test_notes_lifecycle() {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4());
        checkpoint.merge_targets([id(1), id(2)]);
        checkpoint.annotate(&[id(1), id(2)], "write failed: timeout");
        assert_eq!(checkpoint.note.len(), 2);

        checkpoint.append_saved(&[id(1)]);
        checkpoint.clear_notes(&[id(1)]);
        assert_eq!(checkpoint.note.len(), 1);
        assert!(checkpoint.note.contains_key(&id(2)));
    }

    #[test]
    fn test_remaining_is_deterministic() {
        let mut checkpoint = Checkpoint::new(Uuid::new_v4());
        checkpoint.merge_targets([id(3), id(1), id(2)]);
        let first = checkpoint.remaining();
        let second = checkpoint.remaining();
        assert_eq!(first, second);
    }
}
