//! Background prefetch of story content and images for offline reading.
//!
//! A run snapshots what the store has not fetched yet and drains it through
//! two bounded pools, one for story text and one for images. Admission waits
//! for connectivity; work already admitted keeps going when the network
//! drops. Cancellation is cooperative and nothing is written for an item
//! that did not complete.

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::images::{ImageCache, ImageCacheError, ImageKey};
use crate::queue::backoff_delay;
use crate::remote::{RemoteError, RemoteService};
use crate::storage::{FaviconJob, Progress, ProgressKind, Store, StoreError, StoryImage, StoryRef};

#[derive(Debug, Clone)]
pub struct OfflineSettings {
    pub story_workers: usize,
    pub image_workers: usize,
    /// Attempts per item, including the first
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// How long `cancel_all` waits for the pools to wind down
    pub cancel_timeout: Duration,
    /// Most items of each kind picked up by one run
    pub max_items: u32,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            story_workers: 4,
            image_workers: 3,
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
            cancel_timeout: Duration::from_secs(5),
            max_items: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Image(#[from] ImageCacheError),
    #[error("Fetch cancelled")]
    Cancelled,
    #[error("Already being fetched: {0}")]
    InFlight(String),
}

// ============================================================================
// Connectivity
// ============================================================================

/// Shared reachability flag. Clones observe the same state.
#[derive(Clone)]
pub struct Connectivity {
    sender: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Resolves `true` once online, `false` if cancelled first.
    pub async fn wait_online(&self, cancel: &CancellationToken) -> bool {
        let mut receiver = self.sender.subscribe();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            online = receiver.wait_for(|online| *online) => online.is_ok(),
        }
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

// ============================================================================
// Progress & Summaries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct OfflineProgress {
    pub stories: Progress,
    pub images: Progress,
}

/// What one run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub stories_fetched: usize,
    pub stories_failed: usize,
    pub images_fetched: usize,
    pub images_failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Fetched,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone)]
enum ImageJob {
    Story(StoryImage),
    Favicon(FaviconJob),
}

impl ImageJob {
    fn key(&self) -> ImageKey {
        match self {
            ImageJob::Story(image) => ImageKey::StoryImage {
                story_hash: image.story_hash.clone(),
                index: image.index,
            },
            ImageJob::Favicon(job) => ImageKey::Favicon(job.feed_id.clone()),
        }
    }

    fn url(&self) -> &str {
        match self {
            ImageJob::Story(image) => &image.url,
            ImageJob::Favicon(job) => &job.url,
        }
    }
}

/// Removes its identifier from the in-flight set when dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.id);
    }
}

// ============================================================================
// OfflineFetcher
// ============================================================================

type SharedRun = Shared<BoxFuture<'static, RunSummary>>;

struct Run {
    id: u64,
    cancel: CancellationToken,
    abort: AbortHandle,
    done: SharedRun,
}

struct FetcherInner {
    store: Store,
    remote: Arc<dyn RemoteService>,
    images: Arc<ImageCache>,
    connectivity: Connectivity,
    settings: OfflineSettings,
    in_flight: Arc<Mutex<HashSet<String>>>,
    next_run: AtomicU64,
}

/// Prefetches unfetched stories and images. At most one run is active.
pub struct OfflineFetcher {
    inner: Arc<FetcherInner>,
    run: tokio::sync::Mutex<Option<Run>>,
}

impl OfflineFetcher {
    pub fn new(
        store: Store,
        remote: Arc<dyn RemoteService>,
        images: Arc<ImageCache>,
        connectivity: Connectivity,
        settings: OfflineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                store,
                remote,
                images,
                connectivity,
                settings,
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                next_run: AtomicU64::new(1),
            }),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Start a run over everything not fetched yet.
    ///
    /// Returns `false` without doing anything if a run is already active.
    pub async fn start(&self) -> Result<bool, StoreError> {
        let mut slot = self.run.lock().await;
        if slot.as_ref().is_some_and(|run| run.done.peek().is_none()) {
            return Ok(false);
        }

        let inner = &self.inner;
        let limit = inner.settings.max_items;
        let stories = inner.store.unfetched_story_hashes(limit).await?;
        let mut images: Vec<ImageJob> = inner
            .store
            .pending_story_images(limit)
            .await?
            .into_iter()
            .map(ImageJob::Story)
            .collect();
        images.extend(
            inner
                .store
                .uncached_favicons()
                .await?
                .into_iter()
                .map(ImageJob::Favicon),
        );

        inner
            .store
            .set_offline_progress(ProgressKind::Stories, stories.len() as u64)
            .await?;
        inner
            .store
            .set_offline_progress(ProgressKind::Images, images.len() as u64)
            .await?;

        let id = inner.next_run.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            run = id,
            stories = stories.len(),
            images = images.len(),
            "Offline fetch started"
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(inner).run(id, stories, images, cancel.clone()));
        let abort = task.abort_handle();
        let done = async move {
            task.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "Offline fetch task ended abnormally");
                RunSummary::default()
            })
        }
        .boxed()
        .shared();

        *slot = Some(Run {
            id,
            cancel,
            abort,
            done,
        });
        Ok(true)
    }

    /// Cancel the active run and wait, bounded by the cancel timeout, for its
    /// workers to stop.
    pub async fn cancel_all(&self) -> Option<RunSummary> {
        let (id, done) = {
            let slot = self.run.lock().await;
            let run = slot.as_ref()?;
            run.cancel.cancel();
            (run.id, run.done.clone())
        };

        match tokio::time::timeout(self.inner.settings.cancel_timeout, done).await {
            Ok(summary) => {
                tracing::info!(run = id, cancelled = summary.cancelled, "Offline fetch cancelled");
                Some(summary)
            }
            Err(_) => {
                tracing::warn!(run = id, "Offline fetch did not stop in time, aborting");
                if let Some(run) = self.run.lock().await.as_ref() {
                    run.abort.abort();
                }
                None
            }
        }
    }

    /// Wait for the active (or last) run to finish.
    pub async fn wait(&self) -> Option<RunSummary> {
        let done = self.run.lock().await.as_ref().map(|run| run.done.clone())?;
        Some(done.await)
    }

    pub async fn is_running(&self) -> bool {
        self.run
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| run.done.peek().is_none())
    }

    pub async fn progress(&self) -> Result<OfflineProgress, StoreError> {
        Ok(OfflineProgress {
            stories: self.inner.store.offline_progress(ProgressKind::Stories).await?,
            images: self.inner.store.offline_progress(ProgressKind::Images).await?,
        })
    }

    /// Foreground fetch of one story's content, sharing the in-flight set
    /// with background runs.
    pub async fn fetch_story_now(
        &self,
        feed_id: &str,
        story_hash: &str,
    ) -> Result<String, FetchError> {
        let id = story_id(story_hash);
        let _guard = self
            .inner
            .claim(&id)
            .ok_or_else(|| FetchError::InFlight(story_hash.to_string()))?;

        let remote = &self.inner.remote;
        let body = self
            .inner
            .with_retries(&CancellationToken::new(), || {
                remote.fetch_story_content(feed_id, story_hash)
            })
            .await?;
        self.inner.store.store_story_content(story_hash, &body).await?;
        Ok(body)
    }
}

impl FetcherInner {
    async fn run(
        self: Arc<Self>,
        id: u64,
        stories: Vec<StoryRef>,
        images: Vec<ImageJob>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let story_pool = {
            let inner = Arc::clone(&self);
            let cancel = cancel.clone();
            stream::iter(stories)
                .map(move |job| {
                    let inner = Arc::clone(&inner);
                    let cancel = cancel.clone();
                    async move { inner.story_job(job, &cancel).await }
                })
                .buffer_unordered(self.settings.story_workers.max(1))
                .collect::<Vec<Outcome>>()
        };

        let image_pool = {
            let inner = Arc::clone(&self);
            let cancel = cancel.clone();
            stream::iter(images)
                .map(move |job| {
                    let inner = Arc::clone(&inner);
                    let cancel = cancel.clone();
                    async move { inner.image_job(job, &cancel).await }
                })
                .buffer_unordered(self.settings.image_workers.max(1))
                .collect::<Vec<Outcome>>()
        };

        let (story_outcomes, image_outcomes) = tokio::join!(story_pool, image_pool);

        let mut summary = RunSummary::default();
        for outcome in story_outcomes {
            match outcome {
                Outcome::Fetched => summary.stories_fetched += 1,
                Outcome::Failed => summary.stories_failed += 1,
                Outcome::Cancelled => summary.cancelled += 1,
                Outcome::Skipped => {}
            }
        }
        for outcome in image_outcomes {
            match outcome {
                Outcome::Fetched => summary.images_fetched += 1,
                Outcome::Failed => summary.images_failed += 1,
                Outcome::Cancelled => summary.cancelled += 1,
                Outcome::Skipped => {}
            }
        }

        tracing::info!(
            run = id,
            stories_fetched = summary.stories_fetched,
            stories_failed = summary.stories_failed,
            images_fetched = summary.images_fetched,
            images_failed = summary.images_failed,
            cancelled = summary.cancelled,
            "Offline fetch finished"
        );
        summary
    }

    async fn story_job(&self, job: StoryRef, cancel: &CancellationToken) -> Outcome {
        if !self.connectivity.wait_online(cancel).await {
            return Outcome::Cancelled;
        }
        let Some(_guard) = self.claim(&story_id(&job.hash)) else {
            self.complete(ProgressKind::Stories).await;
            return Outcome::Skipped;
        };

        let remote = &self.remote;
        let fetched = self
            .with_retries(cancel, || remote.fetch_story_content(&job.feed_id, &job.hash))
            .await;

        let outcome = match fetched {
            Ok(_) if cancel.is_cancelled() => return Outcome::Cancelled,
            Ok(body) => match self.store.store_story_content(&job.hash, &body).await {
                Ok(_) => Outcome::Fetched,
                Err(e) => {
                    tracing::warn!(story_hash = %job.hash, error = %e, "Failed to store story content");
                    Outcome::Failed
                }
            },
            Err(FetchError::Cancelled) => return Outcome::Cancelled,
            Err(e) => {
                tracing::warn!(feed_id = %job.feed_id, story_hash = %job.hash, error = %e, "Story fetch failed");
                Outcome::Failed
            }
        };

        self.complete(ProgressKind::Stories).await;
        outcome
    }

    async fn image_job(&self, job: ImageJob, cancel: &CancellationToken) -> Outcome {
        if !self.connectivity.wait_online(cancel).await {
            return Outcome::Cancelled;
        }
        let key = job.key();
        let Some(_guard) = self.claim(&key.storage_key()) else {
            self.complete(ProgressKind::Images).await;
            return Outcome::Skipped;
        };

        let remote = &self.remote;
        let fetched = self
            .with_retries(cancel, || remote.fetch_image(job.url()))
            .await;

        let outcome = match fetched {
            Ok(_) if cancel.is_cancelled() => return Outcome::Cancelled,
            Ok(blob) => match self.images.put(&key, blob).await {
                Ok(()) => Outcome::Fetched,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to cache image");
                    Outcome::Failed
                }
            },
            Err(FetchError::Cancelled) => return Outcome::Cancelled,
            Err(e) => {
                tracing::debug!(key = %key, url = job.url(), error = %e, "Image fetch failed");
                Outcome::Failed
            }
        };

        self.complete(ProgressKind::Images).await;
        outcome
    }

    /// Run `op` with a per-attempt timeout, retrying retryable failures with
    /// exponential backoff up to `max_attempts`.
    async fn with_retries<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = tokio::time::timeout(self.settings.attempt_timeout, op()) => {
                    result.unwrap_or(Err(RemoteError::Timeout))
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.settings.max_attempts => {
                    let delay =
                        backoff_delay(self.settings.retry_base, self.settings.retry_max, attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying fetch");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn claim(&self, id: &str) -> Option<InFlightGuard> {
        let mut set = lock(&self.in_flight);
        if !set.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            id: id.to_string(),
        })
    }

    async fn complete(&self, kind: ProgressKind) {
        if let Err(e) = self.store.decrement_offline_remaining(kind).await {
            tracing::warn!(kind = kind.as_str(), error = %e, "Failed to update offline progress");
        }
    }
}

fn story_id(story_hash: &str) -> String {
    format!("story:{story_hash}")
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
