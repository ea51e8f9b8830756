//! Shared fixtures for integration tests: a scriptable in-memory remote and
//! helpers that seed a store.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use feedsync::intelligence::StoryIntelligence;
use feedsync::remote::{RemoteError, RemoteService};
use feedsync::storage::{Feed, FeedsAndFolders, Folder, FolderChild, Story, ROOT_FOLDER};
use feedsync::{Store, UnreadCounts};

/// One request seen by [`FakeRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    MarkRead { feed_id: String, hashes: Vec<String> },
    MarkUnread { feed_id: String, hashes: Vec<String> },
    MarkSaved(String),
    MarkUnsaved(String),
    StoryContent(String),
    Image(String),
    FeedsAndFolders,
    UnreadHashes,
    Stories(Vec<String>),
}

/// In-memory [`RemoteService`] with scripted failures, an optional delay and
/// a record of every call.
#[derive(Default)]
pub struct FakeRemote {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<&'static str, VecDeque<RemoteError>>>,
    delay: Mutex<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    pub contents: Mutex<HashMap<String, String>>,
    pub images: Mutex<HashMap<String, Vec<u8>>>,
    pub tree: Mutex<FeedsAndFolders>,
    pub unread: Mutex<HashMap<String, Vec<String>>>,
    pub stories: Mutex<HashMap<String, Story>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `method` fail with `error`.
    pub fn fail_next(&self, method: &'static str, error: RemoteError, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry(method).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    /// Highest number of requests that were running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn request(&self, method: &'static str, call: Call) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn mark_stories_read(
        &self,
        feed_id: &str,
        story_hashes: &[String],
    ) -> Result<(), RemoteError> {
        self.request(
            "mark_stories_read",
            Call::MarkRead {
                feed_id: feed_id.to_string(),
                hashes: story_hashes.to_vec(),
            },
        )
        .await
    }

    async fn mark_stories_unread(
        &self,
        feed_id: &str,
        story_hashes: &[String],
    ) -> Result<(), RemoteError> {
        self.request(
            "mark_stories_unread",
            Call::MarkUnread {
                feed_id: feed_id.to_string(),
                hashes: story_hashes.to_vec(),
            },
        )
        .await
    }

    async fn mark_story_saved(&self, story_hash: &str) -> Result<(), RemoteError> {
        self.request("mark_story_saved", Call::MarkSaved(story_hash.to_string()))
            .await
    }

    async fn mark_story_unsaved(&self, story_hash: &str) -> Result<(), RemoteError> {
        self.request("mark_story_unsaved", Call::MarkUnsaved(story_hash.to_string()))
            .await
    }

    async fn fetch_story_content(
        &self,
        _feed_id: &str,
        story_hash: &str,
    ) -> Result<String, RemoteError> {
        self.request("fetch_story_content", Call::StoryContent(story_hash.to_string()))
            .await?;
        Ok(self
            .contents
            .lock()
            .unwrap()
            .get(story_hash)
            .cloned()
            .unwrap_or_else(|| format!("<p>{story_hash}</p>")))
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.request("fetch_image", Call::Image(url.to_string())).await?;
        Ok(self
            .images
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| url.as_bytes().to_vec()))
    }

    async fn fetch_feeds_and_folders(&self) -> Result<FeedsAndFolders, RemoteError> {
        self.request("fetch_feeds_and_folders", Call::FeedsAndFolders)
            .await?;
        Ok(self.tree.lock().unwrap().clone())
    }

    async fn fetch_unread_story_hashes(&self) -> Result<HashMap<String, Vec<String>>, RemoteError> {
        self.request("fetch_unread_story_hashes", Call::UnreadHashes)
            .await?;
        Ok(self.unread.lock().unwrap().clone())
    }

    async fn fetch_stories(&self, story_hashes: &[String]) -> Result<Vec<Story>, RemoteError> {
        self.request("fetch_stories", Call::Stories(story_hashes.to_vec()))
            .await?;
        let stories = self.stories.lock().unwrap();
        Ok(story_hashes
            .iter()
            .filter_map(|h| stories.get(h).cloned())
            .collect())
    }
}

// ============================================================================
// Seeding
// ============================================================================

pub async fn memory_store() -> Store {
    Store::open(":memory:").await.unwrap()
}

pub fn feed(id: &str, counts: UnreadCounts) -> Feed {
    Feed {
        id: id.to_string(),
        title: format!("Feed {id}"),
        favicon_url: None,
        counts,
        last_fetched: None,
        active: true,
    }
}

pub fn story(hash: &str, feed_id: &str, intelligence: StoryIntelligence, read: bool) -> Story {
    Story {
        hash: hash.to_string(),
        feed_id: feed_id.to_string(),
        title: format!("Story {hash}"),
        permalink: Some(format!("https://example.com/{hash}")),
        read,
        saved: false,
        timestamp: 1_700_000_000,
        intelligence,
        image_urls: Vec::new(),
        content: None,
        state_at: 0,
    }
}

pub fn positive() -> StoryIntelligence {
    StoryIntelligence {
        title: 1,
        ..StoryIntelligence::default()
    }
}

pub fn negative() -> StoryIntelligence {
    StoryIntelligence {
        author: -1,
        ..StoryIntelligence::default()
    }
}

/// Seed feed `42` in the root folder with two unread stories: `abc123`
/// (positive) and `def456` (neutral). Confirmed counts are ps=1, nt=1.
pub async fn seed_feed_42(store: &Store) {
    store
        .upsert_feeds(&[feed("42", UnreadCounts::new(1, 1, 0))])
        .await
        .unwrap();
    store
        .upsert_folders(&[Folder {
            name: ROOT_FOLDER.to_string(),
            children: vec![FolderChild::Feed("42".to_string())],
        }])
        .await
        .unwrap();
    store
        .upsert_stories(&[
            story("abc123", "42", positive(), false),
            story("def456", "42", StoryIntelligence::default(), false),
        ])
        .await
        .unwrap();
}
