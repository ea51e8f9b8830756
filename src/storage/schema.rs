use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};

use super::types::{StoreChange, StoreError};

// ============================================================================
// Migrations
// ============================================================================

/// Ordered schema steps. Step `n` (zero-based) upgrades `user_version` `n` to
/// `n + 1`; each step commits together with its version bump.
const MIGRATIONS: &[&[&str]] = &[
    // v1: feeds, folders, stories, pending queue, image index
    &[
        r#"
        CREATE TABLE feeds (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            favicon_url TEXT,
            ps INTEGER NOT NULL DEFAULT 0,
            nt INTEGER NOT NULL DEFAULT 0,
            ng INTEGER NOT NULL DEFAULT 0,
            last_fetched INTEGER,
            active INTEGER NOT NULL DEFAULT 1
        )
        "#,
        "CREATE TABLE folders (name TEXT PRIMARY KEY)",
        r#"
        CREATE TABLE folder_children (
            folder TEXT NOT NULL REFERENCES folders(name) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            child_feed TEXT,
            child_folder TEXT,
            PRIMARY KEY (folder, position)
        )
        "#,
        r#"
        CREATE TABLE stories (
            hash TEXT PRIMARY KEY,
            feed_id TEXT NOT NULL,
            title TEXT NOT NULL,
            permalink TEXT,
            read INTEGER NOT NULL DEFAULT 0,
            saved INTEGER NOT NULL DEFAULT 0,
            timestamp INTEGER NOT NULL,
            intel_version INTEGER NOT NULL DEFAULT 1,
            intel_author INTEGER NOT NULL DEFAULT 0,
            intel_tag INTEGER NOT NULL DEFAULT 0,
            intel_title INTEGER NOT NULL DEFAULT 0,
            intel_feed INTEGER NOT NULL DEFAULT 0,
            content TEXT
        )
        "#,
        "CREATE INDEX idx_stories_feed_read ON stories(feed_id, read, timestamp DESC)",
        r#"
        CREATE TABLE pending_actions (
            feed_id TEXT NOT NULL,
            story_hash TEXT NOT NULL,
            class TEXT NOT NULL,
            seq INTEGER NOT NULL,
            action TEXT NOT NULL,
            cutoff_timestamp INTEGER,
            enqueued_at INTEGER NOT NULL,
            PRIMARY KEY (feed_id, story_hash, class)
        )
        "#,
        r#"
        CREATE TABLE cached_images (
            key TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            tick INTEGER NOT NULL,
            accessed_at INTEGER NOT NULL
        )
        "#,
    ],
    // v2: per-story image list and offline fetch counters
    &[
        r#"
        CREATE TABLE story_images (
            story_hash TEXT NOT NULL REFERENCES stories(hash) ON DELETE CASCADE,
            idx INTEGER NOT NULL,
            url TEXT NOT NULL,
            cached INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (story_hash, idx)
        )
        "#,
        "CREATE INDEX idx_story_images_uncached ON story_images(cached) WHERE cached = 0",
        r#"
        CREATE TABLE offline_progress (
            kind TEXT PRIMARY KEY,
            total INTEGER NOT NULL,
            remaining INTEGER NOT NULL
        )
        "#,
    ],
    // v3: last-write-wins timestamp for read/saved flags, unfetched index
    &[
        "ALTER TABLE stories ADD COLUMN state_at INTEGER NOT NULL DEFAULT 0",
        "CREATE INDEX idx_stories_unfetched ON stories(timestamp DESC) WHERE content IS NULL",
    ],
];

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

// ============================================================================
// Store
// ============================================================================

/// Handle to the local store.
///
/// Cloning is cheap and every clone shares the pool, the writer gate and the
/// change channel.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    generation: Arc<AtomicU64>,
    changes: broadcast::Sender<StoreChange>,
}

impl Store {
    /// Open (or create) the store at `path` and bring its schema up to date.
    ///
    /// `":memory:"` opens a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InstanceLocked` if another process holds the lock,
    /// `StoreError::Corrupt` if the file is not a readable database and
    /// `StoreError::IncompatibleSchema` if a newer build wrote it.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        #[cfg(unix)]
        if !in_memory {
            prepare_db_file(std::path::Path::new(path));
        }

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");

        // An in-memory database lives exactly as long as its one connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;

        let (changes, _) = broadcast::channel(64);
        let store = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
            generation: Arc::new(AtomicU64::new(1)),
            changes,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply pending migration steps.
    async fn migrate(&self) -> Result<(), StoreError> {
        let _writer = self.writer.lock().await;

        let (found,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        if found > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::IncompatibleSchema {
                found,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }

        for (step, statements) in MIGRATIONS.iter().enumerate().skip(found.max(0) as usize) {
            let version = step as i64 + 1;
            let migration_error = |e: sqlx::Error| match StoreError::from_sqlx(e) {
                StoreError::Other(e) => StoreError::Migration {
                    version,
                    message: e.to_string(),
                },
                other => other,
            };

            let mut tx = self.pool.begin().await.map_err(migration_error)?;
            for sql in statements.iter() {
                sqlx::query(sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(migration_error)?;
            }
            // PRAGMA does not accept bound parameters.
            sqlx::query(&format!("PRAGMA user_version = {version}"))
                .execute(&mut *tx)
                .await
                .map_err(migration_error)?;
            tx.commit().await.map_err(migration_error)?;

            tracing::info!(version, "Applied store migration");
        }

        Ok(())
    }

    /// Schema version recorded in the file.
    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// Counter bumped by every committed write that can change unread counts.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Receive a notification after every committed write.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Take the writer gate and open a transaction.
    ///
    /// Writes are serialized store-wide; readers keep using the pool. Do not
    /// touch `self.pool` while the returned transaction is open: an in-memory
    /// store only has one connection.
    pub(crate) async fn begin_write(
        &self,
    ) -> Result<(MutexGuard<'_, ()>, Transaction<'static, Sqlite>), StoreError> {
        let guard = self.writer.lock().await;
        let tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;
        Ok((guard, tx))
    }

    /// Publish a committed change.
    pub(crate) fn notify(&self, change: StoreChange) {
        if change.affects_counts() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Restrict the database file to the current user before SQLite opens it.
#[cfg(unix)]
fn prepare_db_file(db_path: &std::path::Path) {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    if db_path.exists() {
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(db_path, perms) {
            tracing::warn!(path = %db_path.display(), error = %e, "Failed to set store file permissions");
        }
    } else if db_path.parent().is_some_and(|p| p.as_os_str().is_empty() || p.exists()) {
        // Create with the final mode so the file never exists world-readable.
        // Failure surfaces from SQLite on connect.
        let _ = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(db_path);
    }
}
