//! The application context.
//!
//! [`SyncContext`] is built once at startup and owns every component: the
//! store, the action queue, the unread counter, the image cache and the
//! offline fetcher. Callers hold it by reference; nothing here is global.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::counts::{CountError, UnreadCounter, UnreadCounts};
use crate::images::{CacheStats, ImageCache, ImageCacheError, ImageCacheSettings};
use crate::offline::{Connectivity, OfflineFetcher, OfflineProgress, OfflineSettings};
use crate::queue::{EnqueueOutcome, FlushReport, QueueSettings, ReadStateQueue, StoryAction};
use crate::remote::{HttpRemote, RemoteError, RemoteService};
use crate::storage::{now_millis, Store, StoreError, ROOT_FOLDER};

/// Hashes per story metadata request during a sync.
const STORY_FETCH_BATCH: usize = 100;

pub const DATABASE_FILE: &str = "feedsync.db";
pub const IMAGES_DIR: &str = "images";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Images(#[from] ImageCacheError),
    #[error(transparent)]
    Count(#[from] CountError),
}

/// Tunables for every component, usually derived from [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ContextSettings {
    pub queue: QueueSettings,
    pub offline: OfflineSettings,
    pub images: ImageCacheSettings,
    /// Read stories older than this are removed after a sync
    pub keep_read: Option<Duration>,
    /// Images not accessed for this long are removed after a sync
    pub image_max_age: Option<Duration>,
}

impl From<&Config> for ContextSettings {
    fn from(config: &Config) -> Self {
        Self {
            queue: config.queue_settings(),
            offline: config.offline_settings(),
            images: config.image_settings(),
            keep_read: config.keep_read(),
            image_max_age: config.image_max_age(),
        }
    }
}

/// Result of [`SyncContext::sync_metadata`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub feeds: usize,
    pub unread_hashes: usize,
    pub reconciled: u64,
    pub stories_fetched: usize,
    pub stories_removed: u64,
    pub images_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FeedStatus {
    pub id: String,
    pub title: String,
    pub counts: UnreadCounts,
}

/// Snapshot of the engine for display.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Status {
    pub account: UnreadCounts,
    pub root: Option<UnreadCounts>,
    pub feeds: Vec<FeedStatus>,
    pub pending_actions: usize,
    pub flushing: bool,
    pub online: bool,
    pub offline: OfflineProgress,
    pub images: CacheStats,
}

pub struct SyncContext {
    store: Store,
    remote: Arc<dyn RemoteService>,
    queue: ReadStateQueue,
    counter: Arc<UnreadCounter>,
    images: Arc<ImageCache>,
    fetcher: OfflineFetcher,
    connectivity: Connectivity,
    settings: ContextSettings,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
    /// Open the store and image cache under `data_dir` and talk to the
    /// server named in `config`.
    pub async fn open(config: &Config, data_dir: &Path) -> Result<Self, SyncError> {
        let db_path = data_dir.join(DATABASE_FILE);
        let store = Store::open(&db_path.to_string_lossy()).await?;

        let remote = HttpRemote::new(&config.server_url, config.session_token())?
            .with_request_timeout(Duration::from_secs(config.queue.attempt_timeout_secs))
            .with_private_hosts(config.allow_private_hosts);

        Self::with_remote(
            store,
            Arc::new(remote),
            &data_dir.join(IMAGES_DIR),
            ContextSettings::from(config),
        )
        .await
    }

    /// Assemble a context from an open store and any remote implementation.
    pub async fn with_remote(
        store: Store,
        remote: Arc<dyn RemoteService>,
        images_dir: &Path,
        settings: ContextSettings,
    ) -> Result<Self, SyncError> {
        let queue =
            ReadStateQueue::load(store.clone(), Arc::clone(&remote), settings.queue.clone()).await?;
        let counter = Arc::new(UnreadCounter::load(store.clone(), queue.clone()).await?);
        let images =
            Arc::new(ImageCache::open(images_dir, store.clone(), settings.images.clone()).await?);
        let connectivity = Connectivity::default();
        let fetcher = OfflineFetcher::new(
            store.clone(),
            Arc::clone(&remote),
            Arc::clone(&images),
            connectivity.clone(),
            settings.offline.clone(),
        );

        Ok(Self {
            store,
            remote,
            queue,
            counter,
            images,
            fetcher,
            connectivity,
            settings,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the periodic flush and the count invalidation listener.
    pub fn start_background(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.queue.spawn_auto_flush(self.cancel.child_token()));
        tasks.push(
            self.counter
                .spawn_invalidation_listener(self.cancel.child_token()),
        );
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &ReadStateQueue {
        &self.queue
    }

    pub fn counter(&self) -> &UnreadCounter {
        &self.counter
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn fetcher(&self) -> &OfflineFetcher {
        &self.fetcher
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    // ========================================================================
    // User Actions
    // ========================================================================

    pub async fn mark_story_read(
        &self,
        feed_id: &str,
        story_hash: &str,
    ) -> Result<EnqueueOutcome, SyncError> {
        self.act(feed_id, story_hash, StoryAction::MarkRead).await
    }

    pub async fn mark_story_unread(
        &self,
        feed_id: &str,
        story_hash: &str,
    ) -> Result<EnqueueOutcome, SyncError> {
        self.act(feed_id, story_hash, StoryAction::MarkUnread).await
    }

    pub async fn mark_story_saved(
        &self,
        feed_id: &str,
        story_hash: &str,
    ) -> Result<EnqueueOutcome, SyncError> {
        self.act(feed_id, story_hash, StoryAction::MarkSaved).await
    }

    pub async fn mark_story_unsaved(
        &self,
        feed_id: &str,
        story_hash: &str,
    ) -> Result<EnqueueOutcome, SyncError> {
        self.act(feed_id, story_hash, StoryAction::MarkUnsaved).await
    }

    async fn act(
        &self,
        feed_id: &str,
        story_hash: &str,
        action: StoryAction,
    ) -> Result<EnqueueOutcome, SyncError> {
        let outcome = self.queue.enqueue(feed_id, story_hash, action, None).await?;
        tracing::debug!(
            feed_id = %feed_id,
            story_hash = %story_hash,
            action = action.as_str(),
            "Queued story action"
        );
        Ok(outcome)
    }

    /// Queue a mark-read for every story of the feed published at or before
    /// `cutoff` (all stories when `None`) that is currently observed unread.
    ///
    /// Returns the number of stories queued.
    pub async fn mark_feed_read(
        &self,
        feed_id: &str,
        cutoff: Option<i64>,
    ) -> Result<usize, SyncError> {
        let states = self.store.feed_story_states(feed_id, cutoff).await?;

        let mut queued = 0;
        for state in states {
            if self.queue.observed_read(feed_id, &state.hash, state.read) {
                continue;
            }
            self.queue
                .enqueue(feed_id, &state.hash, StoryAction::MarkRead, cutoff)
                .await?;
            queued += 1;
        }

        tracing::info!(feed_id = %feed_id, queued, "Marked feed read");
        Ok(queued)
    }

    /// Forget the pending read-state action for a story.
    pub async fn dequeue(&self, story_hash: &str, feed_id: &str) -> Result<bool, SyncError> {
        Ok(self.queue.dequeue(story_hash, feed_id).await?)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Flush pending actions and refresh counts afterwards.
    pub async fn flush(&self, force_check: bool) -> FlushReport {
        let report = self.queue.flush(force_check).await;
        if let Err(e) = self.counter.refresh().await {
            tracing::warn!(error = %e, "Failed to refresh unread counts after flush");
        }
        report
    }

    /// Pull the feed tree, unread hashes and missing story metadata from the
    /// server.
    ///
    /// Local flags are reconciled with the server's unread list as of the
    /// moment the request was issued; stories with pending actions keep
    /// their local state.
    pub async fn sync_metadata(&self) -> Result<SyncReport, SyncError> {
        let state_at = now_millis();
        let mut report = SyncReport::default();

        let snapshot = self.remote.fetch_feeds_and_folders().await?;
        report.feeds = self.store.replace_feeds_and_folders(&snapshot).await?;

        let unread = self.remote.fetch_unread_story_hashes().await?;
        let mut pulled_feeds: Vec<String> = unread.keys().cloned().collect();
        pulled_feeds.sort();
        let server_unread: HashSet<String> = unread.into_values().flatten().collect();
        report.unread_hashes = server_unread.len();

        let protected = self.queue.protected_hashes();
        report.reconciled = self
            .store
            .reconcile_unread_hashes(&server_unread, &protected, state_at)
            .await?;

        let mut wanted: Vec<String> = server_unread.into_iter().collect();
        wanted.sort();
        let missing = self.store.missing_story_hashes(&wanted).await?;
        for chunk in missing.chunks(STORY_FETCH_BATCH) {
            let mut stories = self.remote.fetch_stories(chunk).await?;
            for story in &mut stories {
                story.state_at = state_at;
            }
            report.stories_fetched += self.store.upsert_stories(&stories).await?;
        }
        self.store
            .update_feeds_fetched(&pulled_feeds, chrono::Utc::now().timestamp())
            .await?;

        if let Some(keep) = self.settings.keep_read {
            let older_than = chrono::Utc::now().timestamp() - keep.as_secs() as i64;
            report.stories_removed = self.store.cleanup_stories(older_than).await?;
        }
        if let Some(max_age) = self.settings.image_max_age {
            report.images_removed = self.images.cleanup(max_age).await?;
        }

        self.counter.refresh().await?;
        tracing::info!(
            feeds = report.feeds,
            unread = report.unread_hashes,
            reconciled = report.reconciled,
            fetched = report.stories_fetched,
            removed = report.stories_removed,
            "Metadata sync finished"
        );
        Ok(report)
    }

    /// Start prefetching for offline reading. `false` if already running.
    pub async fn start_offline_fetch(&self) -> Result<bool, SyncError> {
        Ok(self.fetcher.start().await?)
    }

    pub async fn cancel_offline_fetch(&self) {
        self.fetcher.cancel_all().await;
    }

    pub async fn status(&self) -> Result<Status, SyncError> {
        self.counter.refresh().await?;

        let feeds = self
            .store
            .get_feeds()
            .await?
            .into_iter()
            .map(|feed| FeedStatus {
                counts: self.counter.split_unread_count(&feed.id),
                id: feed.id,
                title: feed.title,
            })
            .collect();

        let root = match self.counter.split_folder_unread_count(ROOT_FOLDER) {
            Ok(counts) => Some(counts),
            Err(e) => {
                tracing::warn!(error = %e, "Folder tree is invalid");
                None
            }
        };

        Ok(Status {
            account: self.counter.split_account_unread_count(),
            root,
            feeds,
            pending_actions: self.queue.len(),
            flushing: self.queue.is_flushing(),
            online: self.connectivity.is_online(),
            offline: self.fetcher.progress().await?,
            images: self.images.stats(),
        })
    }

    /// Stop background work and close the store. Pending actions are
    /// already durable.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.fetcher.cancel_all().await;

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "Background task ended abnormally");
            }
        }

        if let Err(e) = self.images.persist_access().await {
            tracing::warn!(error = %e, "Failed to persist image access order");
        }
        self.store.close().await;
        tracing::debug!("Sync context shut down");
    }
}
