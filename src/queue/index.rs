//! In-memory index of pending story actions.
//!
//! This is the synchronous core of the read-state queue: dedupe, supersede
//! and cancel-out rules live here, free of I/O, so they can be exercised
//! directly. [`super::ReadStateQueue`] wraps it with persistence and flushing.

use std::collections::{HashMap, HashSet};

/// A user action on a story, waiting for the server to acknowledge it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoryAction {
    MarkRead,
    MarkUnread,
    MarkSaved,
    MarkUnsaved,
}

/// Actions in the same class contradict each other; actions in different
/// classes are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionClass {
    ReadState,
    SavedState,
}

impl StoryAction {
    pub fn class(self) -> ActionClass {
        match self {
            StoryAction::MarkRead | StoryAction::MarkUnread => ActionClass::ReadState,
            StoryAction::MarkSaved | StoryAction::MarkUnsaved => ActionClass::SavedState,
        }
    }

    pub fn opposite(self) -> StoryAction {
        match self {
            StoryAction::MarkRead => StoryAction::MarkUnread,
            StoryAction::MarkUnread => StoryAction::MarkRead,
            StoryAction::MarkSaved => StoryAction::MarkUnsaved,
            StoryAction::MarkUnsaved => StoryAction::MarkSaved,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoryAction::MarkRead => "mark_read",
            StoryAction::MarkUnread => "mark_unread",
            StoryAction::MarkSaved => "mark_saved",
            StoryAction::MarkUnsaved => "mark_unsaved",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mark_read" => Some(StoryAction::MarkRead),
            "mark_unread" => Some(StoryAction::MarkUnread),
            "mark_saved" => Some(StoryAction::MarkSaved),
            "mark_unsaved" => Some(StoryAction::MarkUnsaved),
            _ => None,
        }
    }
}

impl ActionClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionClass::ReadState => "read",
            ActionClass::SavedState => "saved",
        }
    }
}

/// Identity of a queue slot: one per story and action class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub feed_id: String,
    pub story_hash: String,
    pub class: ActionClass,
}

/// A pending action.
///
/// `seq` increases with every new action and identifies exactly which
/// version of a slot a flush sent, so an acknowledgement for a superseded
/// action can be told apart from one for the current action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub seq: u64,
    pub feed_id: String,
    pub story_hash: String,
    pub action: StoryAction,
    pub cutoff_timestamp: Option<i64>,
    pub enqueued_at: i64,
}

impl QueueEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey {
            feed_id: self.feed_id.clone(),
            story_hash: self.story_hash.clone(),
            class: self.action.class(),
        }
    }
}

/// What `enqueue` did to the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No entry existed for the slot.
    Inserted(QueueEntry),
    /// The slot now holds this entry (same action refreshed, or an in-flight
    /// opposite action superseded).
    Replaced(QueueEntry),
    /// A pending opposite action was removed and nothing was queued.
    Cancelled(QueueEntry),
}

#[derive(Debug, Default)]
pub struct PendingIndex {
    entries: HashMap<EntryKey, QueueEntry>,
    in_flight: HashSet<u64>,
    next_seq: u64,
}

impl PendingIndex {
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            ..Self::default()
        }
    }

    /// Rebuild the index from persisted entries.
    ///
    /// If the durable table somehow holds two entries for one slot, the one
    /// with the higher `seq` wins.
    pub fn from_entries(entries: Vec<QueueEntry>) -> Self {
        let mut index = Self::new();
        for entry in entries {
            index.next_seq = index.next_seq.max(entry.seq.saturating_add(1));
            let key = entry.key();
            match index.entries.get(&key) {
                Some(existing) if existing.seq > entry.seq => {}
                _ => {
                    index.entries.insert(key, entry);
                }
            }
        }
        index
    }

    pub fn enqueue(
        &mut self,
        feed_id: &str,
        story_hash: &str,
        action: StoryAction,
        cutoff_timestamp: Option<i64>,
        now: i64,
    ) -> EnqueueOutcome {
        let key = EntryKey {
            feed_id: feed_id.to_string(),
            story_hash: story_hash.to_string(),
            class: action.class(),
        };

        if let Some(existing) = self.entries.get_mut(&key) {
            if existing.action == action {
                existing.cutoff_timestamp = cutoff_timestamp;
                existing.enqueued_at = now;
                return EnqueueOutcome::Replaced(existing.clone());
            }

            if !self.in_flight.contains(&existing.seq) {
                let removed = existing.clone();
                self.entries.remove(&key);
                return EnqueueOutcome::Cancelled(removed);
            }
            // The opposite action is already on the wire; this one has to
            // follow it rather than cancel it.
        }

        let entry = QueueEntry {
            seq: self.take_seq(),
            feed_id: key.feed_id.clone(),
            story_hash: key.story_hash.clone(),
            action,
            cutoff_timestamp,
            enqueued_at: now,
        };
        match self.entries.insert(key, entry.clone()) {
            Some(_) => EnqueueOutcome::Replaced(entry),
            None => EnqueueOutcome::Inserted(entry),
        }
    }

    pub fn get(&self, key: &EntryKey) -> Option<&QueueEntry> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<QueueEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }

    /// Entries not already on the wire, oldest first, now marked in flight.
    pub fn begin_flush(&mut self) -> Vec<QueueEntry> {
        let mut batch: Vec<QueueEntry> = self
            .entries
            .values()
            .filter(|e| !self.in_flight.contains(&e.seq))
            .cloned()
            .collect();
        batch.sort_by_key(|e| e.seq);
        self.in_flight.extend(batch.iter().map(|e| e.seq));
        batch
    }

    /// Clear the in-flight marks for a finished batch.
    pub fn finish(&mut self, seqs: &[u64]) {
        for seq in seqs {
            self.in_flight.remove(seq);
        }
    }

    /// Remove the slot only if it still holds this exact entry.
    ///
    /// Returns `false` when the entry was superseded (or cancelled) while its
    /// request was in flight.
    pub fn acknowledge(&mut self, entry: &QueueEntry) -> bool {
        let key = entry.key();
        match self.entries.get(&key) {
            Some(current) if current.seq == entry.seq => {
                self.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn is_in_flight(&self, seq: u64) -> bool {
        self.in_flight.contains(&seq)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq.max(1);
        self.next_seq = seq + 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn read_key(feed: &str, hash: &str) -> EntryKey {
        EntryKey {
            feed_id: feed.to_string(),
            story_hash: hash.to_string(),
            class: ActionClass::ReadState,
        }
    }

    #[test]
    fn test_enqueue_inserts() {
        let mut index = PendingIndex::new();
        let outcome = index.enqueue("42", "abc123", StoryAction::MarkRead, None, 100);
        assert!(matches!(outcome, EnqueueOutcome::Inserted(_)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_same_action_replaces_in_place() {
        let mut index = PendingIndex::new();
        index.enqueue("42", "abc123", StoryAction::MarkRead, None, 100);
        let outcome = index.enqueue("42", "abc123", StoryAction::MarkRead, Some(50), 200);

        match outcome {
            EnqueueOutcome::Replaced(entry) => {
                assert_eq!(entry.seq, 1);
                assert_eq!(entry.cutoff_timestamp, Some(50));
                assert_eq!(entry.enqueued_at, 200);
            }
            other => panic!("Expected Replaced, got {:?}", other),
        }
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_opposite_action_cancels_out() {
        let mut index = PendingIndex::new();
        index.enqueue("42", "abc123", StoryAction::MarkRead, None, 100);
        let outcome = index.enqueue("42", "abc123", StoryAction::MarkUnread, None, 101);

        assert!(matches!(outcome, EnqueueOutcome::Cancelled(_)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_opposite_of_in_flight_action_supersedes() {
        let mut index = PendingIndex::new();
        index.enqueue("42", "abc123", StoryAction::MarkRead, None, 100);
        let sent = index.begin_flush();
        assert_eq!(sent.len(), 1);

        let outcome = index.enqueue("42", "abc123", StoryAction::MarkUnread, None, 101);
        let EnqueueOutcome::Replaced(entry) = outcome else {
            panic!("Expected Replaced");
        };
        assert_eq!(entry.action, StoryAction::MarkUnread);
        assert!(entry.seq > sent[0].seq);

        // The ack for the superseded read must not remove the unread.
        assert!(!index.acknowledge(&sent[0]));
        index.finish(&[sent[0].seq]);
        assert_eq!(
            index.get(&read_key("42", "abc123")).map(|e| e.action),
            Some(StoryAction::MarkUnread)
        );
    }

    #[test]
    fn test_classes_are_independent() {
        let mut index = PendingIndex::new();
        index.enqueue("42", "abc123", StoryAction::MarkRead, None, 100);
        index.enqueue("42", "abc123", StoryAction::MarkSaved, None, 100);
        assert_eq!(index.len(), 2);

        index.enqueue("42", "abc123", StoryAction::MarkUnsaved, None, 101);
        assert_eq!(index.len(), 1);
        assert!(index.get(&read_key("42", "abc123")).is_some());
    }

    #[test]
    fn test_begin_flush_skips_in_flight() {
        let mut index = PendingIndex::new();
        index.enqueue("1", "a", StoryAction::MarkRead, None, 1);
        let first = index.begin_flush();
        index.enqueue("1", "b", StoryAction::MarkRead, None, 2);
        let second = index.begin_flush();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].story_hash, "b");
    }

    #[test]
    fn test_from_entries_restores_seq_counter() {
        let mut index = PendingIndex::new();
        index.enqueue("1", "a", StoryAction::MarkRead, None, 1);
        index.enqueue("1", "b", StoryAction::MarkSaved, None, 2);
        let saved: Vec<QueueEntry> = index.iter().cloned().collect();

        let mut rebuilt = PendingIndex::from_entries(saved);
        assert_eq!(rebuilt.len(), 2);
        let EnqueueOutcome::Inserted(entry) =
            rebuilt.enqueue("1", "c", StoryAction::MarkRead, None, 3)
        else {
            panic!("Expected Inserted");
        };
        assert_eq!(entry.seq, 3);
    }

    fn action_strategy() -> impl Strategy<Value = StoryAction> {
        prop_oneof![
            Just(StoryAction::MarkRead),
            Just(StoryAction::MarkUnread),
            Just(StoryAction::MarkSaved),
            Just(StoryAction::MarkUnsaved),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_entry_matching_last_action(
            actions in proptest::collection::vec(action_strategy(), 0..40)
        ) {
            let mut index = PendingIndex::new();
            for (i, action) in actions.iter().enumerate() {
                index.enqueue("42", "abc123", *action, None, i as i64);
            }

            for class in [ActionClass::ReadState, ActionClass::SavedState] {
                let in_class: Vec<_> = index
                    .iter()
                    .filter(|e| e.action.class() == class)
                    .collect();
                prop_assert!(in_class.len() <= 1);

                if let Some(entry) = in_class.first() {
                    let last = actions.iter().rev().find(|a| a.class() == class);
                    prop_assert_eq!(Some(&entry.action), last);
                }
            }
        }
    }
}
