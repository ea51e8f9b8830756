//! Unread count aggregation.
//!
//! Counts shown to the reader are the server-confirmed per-feed counts plus
//! the net effect of actions still waiting in the [`ReadStateQueue`]. The
//! aggregator works from an in-memory snapshot of the store so every accessor
//! is synchronous; the snapshot is refreshed from the store on demand (or by
//! the invalidation listener) and otherwise serves last-known-good values.

use std::collections::{HashMap, HashSet};
use std::ops::{Add, AddAssign};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::intelligence::{self, Bucket, IntelligenceFilter, StoryIntelligence};
use crate::queue::{QueueEntry, ReadStateQueue, StoryAction};
use crate::storage::{FolderChild, Store, StoreError, StoryCountRow};

// ============================================================================
// UnreadCounts
// ============================================================================

/// Unread story counts split by intelligence bucket.
///
/// `ps`, `nt` and `ng` hold positive, neutral and negative stories. Values
/// never go below zero: a decrement past zero clamps, and the desync is
/// corrected by the next full resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UnreadCounts {
    pub ps: u32,
    pub nt: u32,
    pub ng: u32,
}

impl UnreadCounts {
    pub const ZERO: UnreadCounts = UnreadCounts {
        ps: 0,
        nt: 0,
        ng: 0,
    };

    pub fn new(ps: u32, nt: u32, ng: u32) -> Self {
        Self { ps, nt, ng }
    }

    /// Element-wise sum.
    pub fn add_counts(self, other: UnreadCounts) -> UnreadCounts {
        UnreadCounts {
            ps: self.ps.saturating_add(other.ps),
            nt: self.nt.saturating_add(other.nt),
            ng: self.ng.saturating_add(other.ng),
        }
    }

    pub fn total(self) -> u64 {
        u64::from(self.ps) + u64::from(self.nt) + u64::from(self.ng)
    }

    pub fn get(self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::Positive => self.ps,
            Bucket::Neutral => self.nt,
            Bucket::Negative => self.ng,
        }
    }

    /// Shift one bucket by `delta`, clamped to `0..=u32::MAX`.
    pub fn adjust(&mut self, bucket: Bucket, delta: i64) {
        let slot = match bucket {
            Bucket::Positive => &mut self.ps,
            Bucket::Neutral => &mut self.nt,
            Bucket::Negative => &mut self.ng,
        };
        let value = (i64::from(*slot) + delta).clamp(0, i64::from(u32::MAX));
        *slot = value as u32;
    }

    /// Total of the buckets visible under `filter`.
    pub fn filtered_total(self, filter: IntelligenceFilter) -> u64 {
        [Bucket::Positive, Bucket::Neutral, Bucket::Negative]
            .into_iter()
            .filter(|b| filter.includes(*b))
            .map(|b| u64::from(self.get(b)))
            .sum()
    }
}

impl Add for UnreadCounts {
    type Output = UnreadCounts;

    fn add(self, rhs: UnreadCounts) -> UnreadCounts {
        self.add_counts(rhs)
    }
}

impl AddAssign for UnreadCounts {
    fn add_assign(&mut self, rhs: UnreadCounts) {
        *self = self.add_counts(rhs);
    }
}

impl std::iter::Sum for UnreadCounts {
    fn sum<I: Iterator<Item = UnreadCounts>>(iter: I) -> Self {
        iter.fold(UnreadCounts::ZERO, UnreadCounts::add_counts)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CountError {
    /// The folder tree contains a cycle reachable from the queried folder.
    #[error("Invalid folder tree: folder '{folder}' contains itself")]
    InvalidFolderTree { folder: String },
}

// ============================================================================
// Snapshot
// ============================================================================

/// Per-story facts needed to apply pending actions to counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoryCountState {
    pub bucket: Bucket,
    pub read: bool,
}

/// Everything the aggregator reads, captured at one store generation.
#[derive(Debug, Default)]
pub struct CountSnapshot {
    pub generation: u64,
    pub feeds: HashMap<String, UnreadCounts>,
    pub folders: HashMap<String, Vec<FolderChild>>,
    pub stories: HashMap<String, StoryCountState>,
}

/// Net bucket deltas per feed caused by pending read-state actions.
///
/// `entries` must be oldest first. Each story's actions are replayed over its
/// snapshot read state and only the end result counts: a mark-read on a story
/// the snapshot already has as read changes nothing, and a read then unread
/// nets to zero. Stories the store has never seen have no effect; their flush
/// acknowledgement cannot move the confirmed counts either.
pub fn pending_deltas(
    snapshot: &CountSnapshot,
    entries: &[QueueEntry],
) -> HashMap<String, [i64; 3]> {
    let mut observed: HashMap<(&str, &str), (StoryCountState, bool)> = HashMap::new();
    for entry in entries {
        let read = match entry.action {
            StoryAction::MarkRead => true,
            StoryAction::MarkUnread => false,
            StoryAction::MarkSaved | StoryAction::MarkUnsaved => continue,
        };
        let Some(story) = snapshot.stories.get(&entry.story_hash) else {
            continue;
        };
        observed
            .entry((entry.feed_id.as_str(), entry.story_hash.as_str()))
            .or_insert((*story, story.read))
            .1 = read;
    }

    let mut deltas: HashMap<String, [i64; 3]> = HashMap::new();
    for ((feed_id, _), (story, read)) in observed {
        let delta = match (story.read, read) {
            (false, true) => -1,
            (true, false) => 1,
            _ => continue,
        };
        let slot = deltas.entry(feed_id.to_string()).or_insert([0; 3]);
        slot[bucket_slot(story.bucket)] += delta;
    }

    deltas
}

fn bucket_slot(bucket: Bucket) -> usize {
    match bucket {
        Bucket::Positive => 0,
        Bucket::Neutral => 1,
        Bucket::Negative => 2,
    }
}

fn apply_delta(mut counts: UnreadCounts, delta: &[i64; 3]) -> UnreadCounts {
    counts.adjust(Bucket::Positive, delta[0]);
    counts.adjust(Bucket::Neutral, delta[1]);
    counts.adjust(Bucket::Negative, delta[2]);
    counts
}

/// Effective counts for one feed.
pub fn feed_counts(
    snapshot: &CountSnapshot,
    deltas: &HashMap<String, [i64; 3]>,
    feed_id: &str,
) -> UnreadCounts {
    let Some(confirmed) = snapshot.feeds.get(feed_id) else {
        return UnreadCounts::ZERO;
    };
    match deltas.get(feed_id) {
        Some(delta) => apply_delta(*confirmed, delta),
        None => *confirmed,
    }
}

/// Effective counts for a folder, recursing into nested folders.
///
/// A feed reachable through several paths is counted once. Unknown folders
/// count as empty; a folder reachable from itself is an error.
pub fn folder_counts(
    snapshot: &CountSnapshot,
    deltas: &HashMap<String, [i64; 3]>,
    folder: &str,
) -> Result<UnreadCounts, CountError> {
    let mut path = Vec::new();
    let mut seen_feeds = HashSet::new();
    let mut total = UnreadCounts::ZERO;
    walk_folder(
        snapshot,
        deltas,
        folder,
        &mut path,
        &mut seen_feeds,
        &mut total,
    )?;
    Ok(total)
}

fn walk_folder<'a>(
    snapshot: &'a CountSnapshot,
    deltas: &HashMap<String, [i64; 3]>,
    folder: &'a str,
    path: &mut Vec<&'a str>,
    seen_feeds: &mut HashSet<&'a str>,
    total: &mut UnreadCounts,
) -> Result<(), CountError> {
    if path.contains(&folder) {
        return Err(CountError::InvalidFolderTree {
            folder: folder.to_string(),
        });
    }
    let Some(children) = snapshot.folders.get(folder) else {
        return Ok(());
    };

    path.push(folder);
    for child in children {
        match child {
            FolderChild::Feed(feed_id) => {
                if seen_feeds.insert(feed_id.as_str()) {
                    *total += feed_counts(snapshot, deltas, feed_id);
                }
            }
            FolderChild::Folder(name) => {
                walk_folder(snapshot, deltas, name, path, seen_feeds, total)?;
            }
        }
    }
    path.pop();
    Ok(())
}

// ============================================================================
// UnreadCounter
// ============================================================================

#[derive(Default)]
struct Memo {
    generation: u64,
    revision: u64,
    deltas: Option<Arc<HashMap<String, [i64; 3]>>>,
    feeds: HashMap<String, UnreadCounts>,
    folders: HashMap<String, UnreadCounts>,
    account: Option<UnreadCounts>,
}

struct CounterState {
    snapshot: Arc<CountSnapshot>,
    memo: Memo,
    /// Bucket per (story, classifier input); survives snapshot reloads.
    scores: HashMap<String, (StoryIntelligence, Bucket)>,
}

/// Synchronous unread-count accessors over the store and the pending queue.
pub struct UnreadCounter {
    store: Store,
    queue: ReadStateQueue,
    state: Mutex<CounterState>,
}

impl UnreadCounter {
    /// Create a counter with an empty snapshot; call [`refresh`](Self::refresh)
    /// before reading counts.
    pub fn new(store: Store, queue: ReadStateQueue) -> Self {
        Self {
            store,
            queue,
            state: Mutex::new(CounterState {
                snapshot: Arc::new(CountSnapshot::default()),
                memo: Memo::default(),
                scores: HashMap::new(),
            }),
        }
    }

    /// Create a counter and load its first snapshot.
    pub async fn load(store: Store, queue: ReadStateQueue) -> Result<Self, StoreError> {
        let counter = Self::new(store, queue);
        counter.refresh().await?;
        Ok(counter)
    }

    /// Reload the snapshot if the store changed since it was taken.
    ///
    /// Returns whether a reload happened. On error the previous snapshot stays
    /// in place.
    pub async fn refresh(&self) -> Result<bool, StoreError> {
        let generation = self.store.generation();
        {
            let state = self.lock_state();
            if state.snapshot.generation == generation && generation != 0 {
                return Ok(false);
            }
        }

        let feeds = self.store.feed_counts().await?;
        let folders = self.store.folder_tree().await?;
        let story_rows = self.store.story_count_rows().await?;

        let mut state = self.lock_state();
        let stories = score_stories(&mut state.scores, story_rows);
        state.snapshot = Arc::new(CountSnapshot {
            generation,
            feeds,
            folders: folders
                .into_iter()
                .map(|folder| (folder.name, folder.children))
                .collect(),
            stories,
        });
        state.memo = Memo::default();
        drop(state);
        self.queue.retire_confirmed(generation);
        tracing::debug!(generation, "Unread count snapshot refreshed");
        Ok(true)
    }

    /// Effective split counts for a feed. Unknown feeds are zero.
    pub fn split_unread_count(&self, feed_id: &str) -> UnreadCounts {
        let mut state = self.lock_state();
        let deltas = self.deltas(&mut state);
        if let Some(counts) = state.memo.feeds.get(feed_id) {
            return *counts;
        }
        let counts = feed_counts(&state.snapshot, &deltas, feed_id);
        state.memo.feeds.insert(feed_id.to_string(), counts);
        counts
    }

    pub fn unread_count(&self, feed_id: &str) -> u64 {
        self.split_unread_count(feed_id).total()
    }

    /// Unread count for a feed restricted to the buckets `filter` shows.
    pub fn unread_count_for(&self, feed_id: &str, filter: IntelligenceFilter) -> u64 {
        self.split_unread_count(feed_id).filtered_total(filter)
    }

    pub fn split_folder_unread_count(&self, folder: &str) -> Result<UnreadCounts, CountError> {
        let mut state = self.lock_state();
        let deltas = self.deltas(&mut state);
        if let Some(counts) = state.memo.folders.get(folder) {
            return Ok(*counts);
        }
        let counts = folder_counts(&state.snapshot, &deltas, folder)?;
        state.memo.folders.insert(folder.to_string(), counts);
        Ok(counts)
    }

    pub fn folder_unread_count(&self, folder: &str) -> Result<u64, CountError> {
        self.split_folder_unread_count(folder).map(UnreadCounts::total)
    }

    /// Sum over every known feed, each counted once.
    pub fn split_account_unread_count(&self) -> UnreadCounts {
        let mut state = self.lock_state();
        let deltas = self.deltas(&mut state);
        if let Some(counts) = state.memo.account {
            return counts;
        }
        let snapshot = Arc::clone(&state.snapshot);
        let counts = snapshot
            .feeds
            .keys()
            .map(|feed_id| feed_counts(&snapshot, &deltas, feed_id))
            .sum();
        state.memo.account = Some(counts);
        counts
    }

    pub fn account_unread_count(&self) -> u64 {
        self.split_account_unread_count().total()
    }

    /// Refresh the snapshot whenever the store reports a change.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let counter = Arc::clone(self);
        let mut changes = counter.store.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            if let Err(e) = counter.refresh().await {
                                tracing::warn!(error = %e, "Failed to refresh unread counts, keeping last known values");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop memoized results if the store or the queue moved on, then return
    /// the deltas for the current snapshot. Confirmations the snapshot is too
    /// old to contain count as if they were still pending.
    fn deltas(&self, state: &mut CounterState) -> Arc<HashMap<String, [i64; 3]>> {
        let generation = self.store.generation();
        let revision = self.queue.revision();
        if state.memo.generation != generation || state.memo.revision != revision {
            state.memo = Memo {
                generation,
                revision,
                ..Memo::default()
            };
        }

        if let Some(deltas) = &state.memo.deltas {
            return Arc::clone(deltas);
        }
        let entries = self.queue.entries_since(state.snapshot.generation);
        let deltas = Arc::new(pending_deltas(&state.snapshot, &entries));
        state.memo.deltas = Some(Arc::clone(&deltas));
        deltas
    }
}

fn score_stories(
    scores: &mut HashMap<String, (StoryIntelligence, Bucket)>,
    rows: Vec<StoryCountRow>,
) -> HashMap<String, StoryCountState> {
    let mut stories = HashMap::with_capacity(rows.len());
    let mut fresh_scores = HashMap::with_capacity(rows.len());

    for row in rows {
        let bucket = match scores.get(&row.hash) {
            Some((input, bucket)) if *input == row.intelligence => *bucket,
            _ => intelligence::bucket(&row.intelligence),
        };
        fresh_scores.insert(row.hash.clone(), (row.intelligence, bucket));
        stories.insert(
            row.hash,
            StoryCountState {
                bucket,
                read: row.read,
            },
        );
    }

    *scores = fresh_scores;
    stories
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn entry(feed: &str, hash: &str, action: StoryAction) -> QueueEntry {
        QueueEntry {
            seq: 1,
            feed_id: feed.to_string(),
            story_hash: hash.to_string(),
            action,
            cutoff_timestamp: None,
            enqueued_at: 0,
        }
    }

    fn snapshot_with_story(bucket: Bucket, read: bool) -> CountSnapshot {
        let mut snapshot = CountSnapshot::default();
        snapshot
            .feeds
            .insert("42".to_string(), UnreadCounts::new(2, 3, 1));
        snapshot
            .stories
            .insert("abc123".to_string(), StoryCountState { bucket, read });
        snapshot
    }

    #[test]
    fn test_add_counts() {
        let a = UnreadCounts::new(1, 2, 3);
        let b = UnreadCounts::new(10, 20, 30);
        assert_eq!(a.add_counts(b), UnreadCounts::new(11, 22, 33));
        assert_eq!(a + UnreadCounts::ZERO, a);
    }

    #[test]
    fn test_adjust_clamps_at_zero() {
        let mut counts = UnreadCounts::new(0, 1, 0);
        counts.adjust(Bucket::Positive, -1);
        counts.adjust(Bucket::Neutral, -5);
        assert_eq!(counts, UnreadCounts::ZERO);
    }

    #[test]
    fn test_filtered_total() {
        let counts = UnreadCounts::new(1, 2, 4);
        assert_eq!(counts.filtered_total(IntelligenceFilter::All), 7);
        assert_eq!(counts.filtered_total(IntelligenceFilter::Some), 3);
        assert_eq!(counts.filtered_total(IntelligenceFilter::Best), 1);
    }

    #[test]
    fn test_pending_read_decrements_story_bucket() {
        let snapshot = snapshot_with_story(Bucket::Positive, false);
        let deltas = pending_deltas(&snapshot, &[entry("42", "abc123", StoryAction::MarkRead)]);
        assert_eq!(
            feed_counts(&snapshot, &deltas, "42"),
            UnreadCounts::new(1, 3, 1)
        );
    }

    #[test]
    fn test_pending_read_on_read_story_is_ignored() {
        let snapshot = snapshot_with_story(Bucket::Neutral, true);
        let deltas = pending_deltas(&snapshot, &[entry("42", "abc123", StoryAction::MarkRead)]);
        assert_eq!(
            feed_counts(&snapshot, &deltas, "42"),
            UnreadCounts::new(2, 3, 1)
        );
    }

    #[test]
    fn test_pending_unread_increments_story_bucket() {
        let snapshot = snapshot_with_story(Bucket::Negative, true);
        let deltas =
            pending_deltas(&snapshot, &[entry("42", "abc123", StoryAction::MarkUnread)]);
        assert_eq!(
            feed_counts(&snapshot, &deltas, "42"),
            UnreadCounts::new(2, 3, 2)
        );
    }

    #[test]
    fn test_confirmed_read_then_pending_unread_nets_zero() {
        let snapshot = snapshot_with_story(Bucket::Positive, false);
        let mut unread = entry("42", "abc123", StoryAction::MarkUnread);
        unread.seq = 2;
        let deltas = pending_deltas(
            &snapshot,
            &[entry("42", "abc123", StoryAction::MarkRead), unread],
        );
        assert_eq!(
            feed_counts(&snapshot, &deltas, "42"),
            UnreadCounts::new(2, 3, 1)
        );
    }

    #[test]
    fn test_saved_actions_do_not_touch_counts() {
        let snapshot = snapshot_with_story(Bucket::Neutral, false);
        let deltas = pending_deltas(&snapshot, &[entry("42", "abc123", StoryAction::MarkSaved)]);
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_unknown_feed_is_zero() {
        let snapshot = CountSnapshot::default();
        assert_eq!(
            feed_counts(&snapshot, &HashMap::new(), "missing"),
            UnreadCounts::ZERO
        );
    }

    #[test]
    fn test_folder_counts_recurse_and_dedupe() {
        let mut snapshot = CountSnapshot::default();
        snapshot.feeds.insert("1".into(), UnreadCounts::new(1, 0, 0));
        snapshot.feeds.insert("2".into(), UnreadCounts::new(0, 2, 0));
        snapshot.folders.insert(
            "A".into(),
            vec![
                FolderChild::Feed("1".into()),
                FolderChild::Folder("B".into()),
            ],
        );
        snapshot.folders.insert(
            "B".into(),
            vec![FolderChild::Feed("2".into()), FolderChild::Feed("1".into())],
        );

        let counts = folder_counts(&snapshot, &HashMap::new(), "A").unwrap();
        assert_eq!(counts, UnreadCounts::new(1, 2, 0));
    }

    #[test]
    fn test_folder_cycle_is_an_error() {
        let mut snapshot = CountSnapshot::default();
        snapshot
            .folders
            .insert("A".into(), vec![FolderChild::Folder("B".into())]);
        snapshot
            .folders
            .insert("B".into(), vec![FolderChild::Folder("A".into())]);

        let result = folder_counts(&snapshot, &HashMap::new(), "A");
        assert_eq!(
            result,
            Err(CountError::InvalidFolderTree {
                folder: "A".to_string()
            })
        );
    }

    #[test]
    fn test_shared_subfolder_is_not_a_cycle() {
        let mut snapshot = CountSnapshot::default();
        snapshot.feeds.insert("1".into(), UnreadCounts::new(0, 1, 0));
        snapshot.folders.insert(
            "A".into(),
            vec![
                FolderChild::Folder("B".into()),
                FolderChild::Folder("C".into()),
            ],
        );
        snapshot
            .folders
            .insert("B".into(), vec![FolderChild::Folder("C".into())]);
        snapshot
            .folders
            .insert("C".into(), vec![FolderChild::Feed("1".into())]);

        let counts = folder_counts(&snapshot, &HashMap::new(), "A").unwrap();
        assert_eq!(counts.total(), 1);
    }

    fn counts_strategy() -> impl Strategy<Value = UnreadCounts> {
        (any::<u32>(), any::<u32>(), any::<u32>())
            .prop_map(|(ps, nt, ng)| UnreadCounts::new(ps, nt, ng))
    }

    proptest! {
        #[test]
        fn prop_add_counts_commutative(a in counts_strategy(), b in counts_strategy()) {
            prop_assert_eq!(a.add_counts(b), b.add_counts(a));
        }

        #[test]
        fn prop_add_counts_associative(
            a in counts_strategy(),
            b in counts_strategy(),
            c in counts_strategy()
        ) {
            prop_assert_eq!(a.add_counts(b).add_counts(c), a.add_counts(b.add_counts(c)));
        }

        #[test]
        fn prop_zero_is_identity(a in counts_strategy()) {
            prop_assert_eq!(a.add_counts(UnreadCounts::ZERO), a);
        }
    }
}
