//! Optimistic read/saved actions waiting for the server.
//!
//! [`ReadStateQueue`] keeps the authoritative in-memory [`PendingIndex`],
//! mirrors every change to the store's `pending_actions` table and flushes
//! batches to the [`RemoteService`]. At most one flush runs at a time; callers
//! that ask for a flush while one is running share its result.

mod index;

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::remote::{RemoteError, RemoteService};
use crate::storage::{now_millis, Store, StoreError};

pub use index::{ActionClass, EnqueueOutcome, EntryKey, PendingIndex, QueueEntry, StoryAction};

// ============================================================================
// Settings & Reports
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Unforced flushes closer together than this are skipped
    pub min_flush_interval: Duration,
    /// Deadline for one request to the server
    pub attempt_timeout: Duration,
    /// First retry delay after a failed flush
    pub backoff_base: Duration,
    /// Upper bound for the retry delay
    pub backoff_max: Duration,
    /// Most story hashes sent in one request
    pub batch_size: usize,
    /// How often the background task tries to flush
    pub auto_flush_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            min_flush_interval: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            batch_size: 100,
            auto_flush_interval: Duration::from_secs(30),
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// The flush did not run (minimum interval or backoff window)
    pub skipped: bool,
    /// Requests sent to the server
    pub requests: usize,
    /// Entries confirmed and removed
    pub acknowledged: usize,
    /// Entries confirmed but replaced by a newer action meanwhile
    pub superseded: usize,
    /// Entries the server refused, now dropped
    pub rejected: usize,
    /// Entries left in the queue afterwards
    pub remaining: usize,
    /// The failure that stopped the flush; its entries stay queued
    pub error: Option<RemoteError>,
}

impl FlushReport {
    fn skipped(remaining: usize) -> Self {
        Self {
            skipped: true,
            remaining,
            ..Self::default()
        }
    }
}

/// A queued action the server refused for good ([`RemoteError::Rejected`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub entry: QueueEntry,
    pub reason: String,
}

/// Delay before the next automatic flush after `failures` consecutive
/// failed flushes: `base * 2^(failures - 1)`, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(failures - 1);
    base.saturating_mul(factor).min(max)
}

// ============================================================================
// ReadStateQueue
// ============================================================================

type SharedFlush = Shared<BoxFuture<'static, FlushReport>>;

/// Confirmations kept for counters that have not refreshed yet.
const MAX_CONFIRMED: usize = 4096;

struct QueueState {
    index: PendingIndex,
    flight: Option<(u64, SharedFlush)>,
    last_flush_at: Option<Instant>,
    failures: u32,
    retry_after: Option<Instant>,
    /// Read-state entries confirmed by the server, with the store generation
    /// right after the confirmation was applied.
    confirmed: Vec<(u64, QueueEntry)>,
}

struct Inner {
    store: Store,
    remote: Arc<dyn RemoteService>,
    settings: QueueSettings,
    state: Mutex<QueueState>,
    /// Orders index changes with their durable writes.
    persist: tokio::sync::Mutex<()>,
    revision: AtomicU64,
    next_flight: AtomicU64,
    rejections: broadcast::Sender<Rejection>,
}

/// One request's worth of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Batch {
    feed_id: String,
    action: StoryAction,
    entries: Vec<QueueEntry>,
}

impl Batch {
    fn hashes(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.story_hash.clone()).collect()
    }
}

/// Handle to the pending action queue. Clones share one queue.
#[derive(Clone)]
pub struct ReadStateQueue {
    inner: Arc<Inner>,
}

impl ReadStateQueue {
    /// Rebuild the queue from the store's durable table.
    pub async fn load(
        store: Store,
        remote: Arc<dyn RemoteService>,
        settings: QueueSettings,
    ) -> Result<Self, StoreError> {
        let entries = store.load_pending_actions().await?;
        let index = PendingIndex::from_entries(entries);
        if !index.is_empty() {
            tracing::info!(pending = index.len(), "Restored pending actions");
        }

        let (rejections, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                remote,
                settings,
                state: Mutex::new(QueueState {
                    index,
                    flight: None,
                    last_flush_at: None,
                    failures: 0,
                    retry_after: None,
                    confirmed: Vec::new(),
                }),
                persist: tokio::sync::Mutex::new(()),
                revision: AtomicU64::new(0),
                next_flight: AtomicU64::new(1),
                rejections,
            }),
        })
    }

    /// Record a user action.
    ///
    /// The in-memory change is visible immediately; the durable write
    /// completes before this returns.
    pub async fn enqueue(
        &self,
        feed_id: &str,
        story_hash: &str,
        action: StoryAction,
        cutoff_timestamp: Option<i64>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let _persist = self.inner.persist.lock().await;

        let outcome = self.inner.lock_state().index.enqueue(
            feed_id,
            story_hash,
            action,
            cutoff_timestamp,
            now_millis(),
        );
        self.inner.bump_revision();

        match &outcome {
            EnqueueOutcome::Inserted(entry) | EnqueueOutcome::Replaced(entry) => {
                self.inner.store.save_pending_action(entry).await?;
            }
            EnqueueOutcome::Cancelled(entry) => {
                tracing::debug!(
                    feed_id = %feed_id,
                    story_hash = %story_hash,
                    cancelled = entry.action.as_str(),
                    "Opposite actions cancelled out"
                );
                self.inner
                    .store
                    .delete_pending_action(&entry.key(), None)
                    .await?;
            }
        }
        Ok(outcome)
    }

    /// Drop the pending read-state action for a story, if any.
    pub async fn dequeue(&self, story_hash: &str, feed_id: &str) -> Result<bool, StoreError> {
        let key = EntryKey {
            feed_id: feed_id.to_string(),
            story_hash: story_hash.to_string(),
            class: ActionClass::ReadState,
        };

        let _persist = self.inner.persist.lock().await;
        let removed = self.inner.lock_state().index.remove(&key);
        let Some(removed) = removed else {
            return Ok(false);
        };
        self.inner.bump_revision();
        self.inner
            .store
            .delete_pending_action(&key, Some(removed.seq))
            .await?;
        Ok(true)
    }

    /// Send pending actions to the server.
    ///
    /// With `force_check == false` the flush is skipped inside the minimum
    /// interval and the backoff window. A flush already in flight is always
    /// joined rather than duplicated.
    ///
    /// # Arguments
    ///
    /// * `force_check` - Ignore the minimum interval and the backoff window
    ///
    /// # Returns
    ///
    /// A [`FlushReport`]. Failures are reported in it rather than returned:
    /// only [`RemoteError::Rejected`] drops entries, any other error leaves
    /// them queued and starts the backoff window.
    pub async fn flush(&self, force_check: bool) -> FlushReport {
        let flight = {
            let mut state = self.inner.lock_state();

            if let Some((_, flight)) = &state.flight {
                flight.clone()
            } else {
                let now = Instant::now();
                if !force_check && self.inner.throttled(&state, now) {
                    return FlushReport::skipped(state.index.len());
                }

                let id = self.inner.next_flight.fetch_add(1, Ordering::SeqCst);
                let inner = Arc::clone(&self.inner);
                let handle = tokio::spawn(inner.run_flush(id));
                let flight = async move {
                    match handle.await {
                        Ok(report) => report,
                        Err(e) => {
                            tracing::error!(error = %e, "Flush task failed");
                            FlushReport {
                                error: Some(RemoteError::Network(e.to_string())),
                                ..FlushReport::default()
                            }
                        }
                    }
                }
                .boxed()
                .shared();

                state.flight = Some((id, flight.clone()));
                flight
            }
        };

        flight.await
    }

    /// Whether a flush is running.
    pub fn is_flushing(&self) -> bool {
        self.inner.lock_state().flight.is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_state().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock_state().index.is_empty()
    }

    /// Snapshot of every pending entry, oldest first.
    pub fn entries(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.inner.lock_state().index.iter().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Pending entries plus read-state entries confirmed after store
    /// `generation`, oldest first.
    ///
    /// Counts loaded at `generation` do not reflect those confirmations yet,
    /// so they still have to be applied on top.
    pub fn entries_since(&self, generation: u64) -> Vec<QueueEntry> {
        let state = self.inner.lock_state();
        let mut entries: Vec<QueueEntry> = state
            .confirmed
            .iter()
            .filter(|(at, _)| *at > generation)
            .map(|(_, entry)| entry.clone())
            .chain(state.index.iter().cloned())
            .collect();
        drop(state);
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Forget confirmations already visible in store `generation`.
    pub fn retire_confirmed(&self, generation: u64) {
        let mut state = self.inner.lock_state();
        let before = state.confirmed.len();
        state.confirmed.retain(|(at, _)| *at > generation);
        if state.confirmed.len() != before {
            drop(state);
            self.inner.bump_revision();
        }
    }

    pub fn pending_for_feed(&self, feed_id: &str) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .inner
            .lock_state()
            .index
            .iter()
            .filter(|e| e.feed_id == feed_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Pending action for one story and class.
    pub fn pending_action(
        &self,
        feed_id: &str,
        story_hash: &str,
        class: ActionClass,
    ) -> Option<StoryAction> {
        let key = EntryKey {
            feed_id: feed_id.to_string(),
            story_hash: story_hash.to_string(),
            class,
        };
        self.inner.lock_state().index.get(&key).map(|e| e.action)
    }

    /// Locally observed read state: the pending action if any, else `confirmed`.
    pub fn observed_read(&self, feed_id: &str, story_hash: &str, confirmed: bool) -> bool {
        match self.pending_action(feed_id, story_hash, ActionClass::ReadState) {
            Some(StoryAction::MarkRead) => true,
            Some(StoryAction::MarkUnread) => false,
            _ => confirmed,
        }
    }

    /// Locally observed saved state.
    pub fn observed_saved(&self, feed_id: &str, story_hash: &str, confirmed: bool) -> bool {
        match self.pending_action(feed_id, story_hash, ActionClass::SavedState) {
            Some(StoryAction::MarkSaved) => true,
            Some(StoryAction::MarkUnsaved) => false,
            _ => confirmed,
        }
    }

    /// Hashes of every story with a pending action.
    pub fn protected_hashes(&self) -> HashSet<String> {
        self.inner
            .lock_state()
            .index
            .iter()
            .map(|e| e.story_hash.clone())
            .collect()
    }

    /// Bumped on every change to the pending set.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    /// Receive every permanently rejected action.
    pub fn subscribe_rejections(&self) -> broadcast::Receiver<Rejection> {
        self.inner.rejections.subscribe()
    }

    /// Flush periodically until `cancel` fires. Throttling and backoff apply.
    pub fn spawn_auto_flush(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        let period = self.inner.settings.auto_flush_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if queue.is_empty() {
                            continue;
                        }
                        let report = queue.flush(false).await;
                        if let Some(e) = &report.error {
                            tracing::debug!(error = %e, remaining = report.remaining, "Background flush deferred");
                        }
                    }
                }
            }
            tracing::debug!("Auto flush stopped");
        })
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    fn throttled(&self, state: &QueueState, now: Instant) -> bool {
        if state.retry_after.is_some_and(|at| now < at) {
            return true;
        }
        state
            .last_flush_at
            .is_some_and(|last| now.duration_since(last) < self.settings.min_flush_interval)
    }

    async fn run_flush(self: Arc<Self>, id: u64) -> FlushReport {
        let sent = self.lock_state().index.begin_flush();
        let seqs: Vec<u64> = sent.iter().map(|e| e.seq).collect();
        let batches = group_batches(sent, self.settings.batch_size.max(1));

        let mut report = FlushReport::default();
        for batch in &batches {
            report.requests += 1;
            match self.send_batch(batch).await {
                Ok(()) => self.acknowledge(batch, &mut report).await,
                Err(e) if e.is_rejection() => self.reject(batch, &e, &mut report).await,
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(
                            feed_id = %batch.feed_id,
                            action = batch.action.as_str(),
                            error = %e,
                            "Flush failed, will retry"
                        );
                    } else {
                        tracing::error!(
                            feed_id = %batch.feed_id,
                            action = batch.action.as_str(),
                            error = %e,
                            "Flush failed, keeping actions queued until the server accepts them"
                        );
                    }
                    report.error = Some(e);
                    break;
                }
            }
        }

        let mut state = self.lock_state();
        state.index.finish(&seqs);
        let now = Instant::now();
        state.last_flush_at = Some(now);
        if report.error.is_some() {
            state.failures = state.failures.saturating_add(1);
            let delay = backoff_delay(
                self.settings.backoff_base,
                self.settings.backoff_max,
                state.failures,
            );
            state.retry_after = Some(now + delay);
        } else {
            state.failures = 0;
            state.retry_after = None;
        }
        report.remaining = state.index.len();
        if state.flight.as_ref().is_some_and(|(flight, _)| *flight == id) {
            state.flight = None;
        }
        drop(state);

        if report.requests > 0 {
            tracing::info!(
                acknowledged = report.acknowledged,
                superseded = report.superseded,
                rejected = report.rejected,
                remaining = report.remaining,
                "Flush finished"
            );
        }
        report
    }

    async fn send_batch(&self, batch: &Batch) -> Result<(), RemoteError> {
        let remote = &self.remote;
        let request = async {
            match batch.action {
                StoryAction::MarkRead => {
                    remote
                        .mark_stories_read(&batch.feed_id, &batch.hashes())
                        .await
                }
                StoryAction::MarkUnread => {
                    remote
                        .mark_stories_unread(&batch.feed_id, &batch.hashes())
                        .await
                }
                StoryAction::MarkSaved => {
                    for entry in &batch.entries {
                        remote.mark_story_saved(&entry.story_hash).await?;
                    }
                    Ok(())
                }
                StoryAction::MarkUnsaved => {
                    for entry in &batch.entries {
                        remote.mark_story_unsaved(&entry.story_hash).await?;
                    }
                    Ok(())
                }
            }
        };

        tokio::time::timeout(self.settings.attempt_timeout, request)
            .await
            .map_err(|_| RemoteError::Timeout)?
    }

    /// Apply a confirmed batch to the store, then retire entries that were
    /// not replaced while the request was out.
    async fn acknowledge(&self, batch: &Batch, report: &mut FlushReport) {
        let hashes = batch.hashes();
        let state_at = now_millis();
        let applied = match batch.action {
            StoryAction::MarkRead | StoryAction::MarkUnread => {
                let read = batch.action == StoryAction::MarkRead;
                self.store
                    .apply_read_confirmation(&batch.feed_id, &hashes, None, read, state_at)
                    .await
            }
            StoryAction::MarkSaved | StoryAction::MarkUnsaved => {
                let saved = batch.action == StoryAction::MarkSaved;
                self.store
                    .apply_saved_confirmation(&hashes, saved, state_at)
                    .await
            }
        };

        // Keep the entries if the confirmation could not be stored; sending
        // the same action again is harmless.
        if let Err(e) = applied {
            tracing::error!(
                feed_id = %batch.feed_id,
                action = batch.action.as_str(),
                error = %e,
                "Failed to apply confirmation, keeping actions queued"
            );
            return;
        }
        let generation = self.store.generation();

        let _persist = self.persist.lock().await;
        for entry in &batch.entries {
            let current = {
                let mut state = self.lock_state();
                let current = state.index.acknowledge(entry);
                if current && entry.action.class() == ActionClass::ReadState {
                    if state.confirmed.len() >= MAX_CONFIRMED {
                        state.confirmed.remove(0);
                    }
                    state.confirmed.push((generation, entry.clone()));
                }
                current
            };
            if !current {
                report.superseded += 1;
                continue;
            }
            report.acknowledged += 1;
            self.bump_revision();
            if let Err(e) = self
                .store
                .delete_pending_action(&entry.key(), Some(entry.seq))
                .await
            {
                tracing::warn!(story_hash = %entry.story_hash, error = %e, "Failed to delete confirmed action");
            }
        }
    }

    /// Drop a batch the server refused and tell subscribers.
    async fn reject(&self, batch: &Batch, error: &RemoteError, report: &mut FlushReport) {
        tracing::warn!(
            feed_id = %batch.feed_id,
            action = batch.action.as_str(),
            stories = batch.entries.len(),
            error = %error,
            "Server rejected queued actions, dropping them"
        );

        let _persist = self.persist.lock().await;
        for entry in &batch.entries {
            if !self.lock_state().index.acknowledge(entry) {
                report.superseded += 1;
                continue;
            }
            report.rejected += 1;
            self.bump_revision();
            if let Err(e) = self
                .store
                .delete_pending_action(&entry.key(), Some(entry.seq))
                .await
            {
                tracing::warn!(story_hash = %entry.story_hash, error = %e, "Failed to delete rejected action");
            }
            // No subscribers is fine.
            let _ = self.rejections.send(Rejection {
                entry: entry.clone(),
                reason: error.to_string(),
            });
        }
    }
}

/// Group entries (oldest first) into requests: read-state actions by feed and
/// action up to `max` hashes, saved-state actions one story per batch.
fn group_batches(entries: Vec<QueueEntry>, max: usize) -> Vec<Batch> {
    let mut batches: Vec<Batch> = Vec::new();
    let mut open: HashMap<(String, StoryAction), usize> = HashMap::new();

    for entry in entries {
        if entry.action.class() == ActionClass::SavedState {
            batches.push(Batch {
                feed_id: entry.feed_id.clone(),
                action: entry.action,
                entries: vec![entry],
            });
            continue;
        }

        let key = (entry.feed_id.clone(), entry.action);
        match open.get(&key) {
            Some(&i) if batches[i].entries.len() < max => batches[i].entries.push(entry),
            _ => {
                open.insert(key, batches.len());
                batches.push(Batch {
                    feed_id: entry.feed_id.clone(),
                    action: entry.action,
                    entries: vec![entry],
                });
            }
        }
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(seq: u64, feed: &str, hash: &str, action: StoryAction) -> QueueEntry {
        QueueEntry {
            seq,
            feed_id: feed.to_string(),
            story_hash: hash.to_string(),
            action,
            cutoff_timestamp: None,
            enqueued_at: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(2);
        let max = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, max, 0), Duration::ZERO);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(base, max, 10), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[test]
    fn test_group_batches_by_feed_and_action() {
        let batches = group_batches(
            vec![
                entry(1, "1", "a", StoryAction::MarkRead),
                entry(2, "2", "b", StoryAction::MarkRead),
                entry(3, "1", "c", StoryAction::MarkRead),
                entry(4, "1", "d", StoryAction::MarkUnread),
                entry(5, "1", "e", StoryAction::MarkSaved),
                entry(6, "1", "f", StoryAction::MarkSaved),
            ],
            100,
        );

        let shape: Vec<(&str, StoryAction, usize)> = batches
            .iter()
            .map(|b| (b.feed_id.as_str(), b.action, b.entries.len()))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("1", StoryAction::MarkRead, 2),
                ("2", StoryAction::MarkRead, 1),
                ("1", StoryAction::MarkUnread, 1),
                ("1", StoryAction::MarkSaved, 1),
                ("1", StoryAction::MarkSaved, 1),
            ]
        );
    }

    #[test]
    fn test_group_batches_splits_at_max() {
        let entries = (0..5)
            .map(|i| entry(i, "1", &format!("h{i}"), StoryAction::MarkRead))
            .collect();
        let batches = group_batches(entries, 2);
        let sizes: Vec<usize> = batches.iter().map(|b| b.entries.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
