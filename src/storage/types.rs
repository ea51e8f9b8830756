use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::counts::UnreadCounts;
use crate::intelligence::StoryIntelligence;

// ============================================================================
// Error Types
// ============================================================================

/// Store errors with user-facing messages.
///
/// `Corrupt` and `IncompatibleSchema` are fatal to the store instance; callers
/// decide whether to reset and resync or halt.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process holds the database lock
    #[error("Another instance of feedsync appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// The file exists but is not a readable SQLite database
    #[error("Local store is corrupt: {0}")]
    Corrupt(String),

    /// The store was written by a newer build
    #[error("Local store schema version {found} is newer than supported version {supported}. Please update feedsync.")]
    IncompatibleSchema { found: i64, supported: i64 },

    /// A migration step failed and was rolled back
    #[error("Store migration to version {version} failed: {message}")]
    Migration { version: i64, message: String },

    /// A record was rejected before anything was written
    #[error("Invalid record: {0}")]
    Invalid(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StoreError {
    /// Classify a sqlx error, recognizing lock contention and corruption.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_NOTADB (26) and SQLITE_CORRUPT (11)
        if error_string.contains("file is not a database")
            || error_string.contains("database disk image is malformed")
        {
            return StoreError::Corrupt(err.to_string());
        }

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StoreError::InstanceLocked;
        }

        StoreError::Other(err)
    }

    /// Whether recreating the store from a full resync could recover.
    pub fn is_recoverable_by_reset(&self) -> bool {
        matches!(self, StoreError::Corrupt(_) | StoreError::Migration { .. })
    }
}

// ============================================================================
// Change Notifications
// ============================================================================

/// What a committed write touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Feeds,
    Stories,
    PendingActions,
    Images,
    Progress,
}

impl StoreChange {
    /// Whether cached unread counts must be recomputed.
    pub fn affects_counts(self) -> bool {
        matches!(self, StoreChange::Feeds | StoreChange::Stories)
    }
}

// ============================================================================
// Records
// ============================================================================

/// Reserved name of the top-level folder.
pub const ROOT_FOLDER: &str = "(root)";

/// Map the remote's empty root folder name to the stored one.
pub fn normalize_folder_name(name: &str) -> &str {
    if name.is_empty() {
        ROOT_FOLDER
    } else {
        name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub favicon_url: Option<String>,
    /// Server-confirmed unread counts
    #[serde(default)]
    pub counts: UnreadCounts,
    #[serde(default)]
    pub last_fetched: Option<i64>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderChild {
    Feed(String),
    Folder(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,
    #[serde(default)]
    pub children: Vec<FolderChild>,
}

/// The whole feed/folder tree as returned by a metadata fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedsAndFolders {
    #[serde(default)]
    pub feeds: Vec<Feed>,
    #[serde(default)]
    pub folders: Vec<Folder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub hash: String,
    pub feed_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub permalink: Option<String>,
    /// Server-confirmed read flag
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub saved: bool,
    /// Publish time, unix seconds
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub intelligence: StoryIntelligence,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// When the read/saved flags were last written, unix millis
    #[serde(default)]
    pub state_at: i64,
}

/// Internal row type for story queries.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StoryDbRow {
    pub hash: String,
    pub feed_id: String,
    pub title: String,
    pub permalink: Option<String>,
    pub read: bool,
    pub saved: bool,
    pub timestamp: i64,
    pub intel_version: i64,
    pub intel_author: i64,
    pub intel_tag: i64,
    pub intel_title: i64,
    pub intel_feed: i64,
    pub content: Option<String>,
    pub state_at: i64,
}

impl StoryDbRow {
    pub(crate) fn intelligence(&self) -> StoryIntelligence {
        intelligence_from_columns(
            self.intel_version,
            self.intel_author,
            self.intel_tag,
            self.intel_title,
            self.intel_feed,
        )
    }

    pub(crate) fn into_story(self, image_urls: Vec<String>) -> Story {
        let intelligence = self.intelligence();
        Story {
            hash: self.hash,
            feed_id: self.feed_id,
            title: self.title,
            permalink: self.permalink,
            read: self.read,
            saved: self.saved,
            timestamp: self.timestamp,
            intelligence,
            image_urls,
            content: self.content,
            state_at: self.state_at,
        }
    }
}

pub(crate) fn intelligence_from_columns(
    version: i64,
    author: i64,
    tag: i64,
    title: i64,
    feed: i64,
) -> StoryIntelligence {
    let narrow = |v: i64| v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    StoryIntelligence {
        version: u32::try_from(version).unwrap_or_default(),
        author: narrow(author),
        tag: narrow(tag),
        title: narrow(title),
        feed: narrow(feed),
    }
}

/// Story facts the unread counter needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryCountRow {
    pub hash: String,
    pub intelligence: StoryIntelligence,
    pub read: bool,
}

/// Confirmed read/saved state of one story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryState {
    pub hash: String,
    pub read: bool,
    pub saved: bool,
    pub timestamp: i64,
}

/// A story whose content has not been fetched yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoryRef {
    pub feed_id: String,
    pub hash: String,
}

/// An image referenced by a story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryImage {
    pub story_hash: String,
    pub index: u32,
    pub url: String,
}

/// A feed favicon that is not in the image cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaviconJob {
    pub feed_id: String,
    pub url: String,
}

/// Row of the cached image index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImageRecord {
    pub key: String,
    pub size: u64,
    /// Logical access order, unique per entry
    pub tick: u64,
    /// Wall-clock last access, unix seconds
    pub accessed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressKind {
    Stories,
    Images,
}

impl ProgressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressKind::Stories => "stories",
            ProgressKind::Images => "images",
        }
    }
}

/// Offline fetch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Progress {
    pub total: u64,
    pub remaining: u64,
}

// ============================================================================
// Validation
// ============================================================================

pub(crate) fn validate_feed(feed: &Feed) -> Result<(), StoreError> {
    if feed.id.trim().is_empty() {
        return Err(StoreError::Invalid(format!(
            "feed '{}' has an empty id",
            feed.title
        )));
    }
    Ok(())
}

pub(crate) fn validate_folder(folder: &Folder) -> Result<(), StoreError> {
    for child in &folder.children {
        let empty = match child {
            FolderChild::Feed(id) => id.trim().is_empty(),
            // Empty folder names refer to the root, which is valid.
            FolderChild::Folder(_) => false,
        };
        if empty {
            return Err(StoreError::Invalid(format!(
                "folder '{}' lists a feed with an empty id",
                folder.name
            )));
        }
    }
    Ok(())
}

pub(crate) fn validate_story(story: &Story) -> Result<(), StoreError> {
    if story.hash.trim().is_empty() {
        return Err(StoreError::Invalid(format!(
            "story '{}' in feed {} has an empty hash",
            story.title, story.feed_id
        )));
    }
    if story.feed_id.trim().is_empty() {
        return Err(StoreError::Invalid(format!(
            "story {} has an empty feed id",
            story.hash
        )));
    }
    Ok(())
}
