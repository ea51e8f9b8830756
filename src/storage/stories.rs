use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::collections::{HashMap, HashSet};

use super::feeds::counts_from_columns;
use super::schema::Store;
use super::types::{
    intelligence_from_columns, validate_story, Story, StoryCountRow, StoryDbRow, StoryRef,
    StoryState, StoreChange, StoreError,
};
use crate::intelligence;

/// Stories per multi-row INSERT (14 binds each).
const STORY_BATCH_SIZE: usize = 50;

/// Hashes per `IN (...)` list.
const HASH_CHUNK: usize = 500;

const STORY_COLUMNS: &str = "hash, feed_id, title, permalink, read, saved, timestamp, \
     intel_version, intel_author, intel_tag, intel_title, intel_feed, content, state_at";

type CandidateRow = (String, i64, i64, i64, i64, i64);

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Store {
    // ========================================================================
    // Story Operations
    // ========================================================================

    /// Insert or replace stories by hash, all-or-nothing.
    ///
    /// Read and saved flags only overwrite the stored ones when the incoming
    /// `state_at` is not older. Existing content is kept when the incoming
    /// story carries none. Feed counts are not touched: they arrive with the
    /// feed records.
    ///
    /// # Arguments
    ///
    /// * `stories` - Story metadata; `state_at` orders competing read/saved
    ///   writes
    ///
    /// # Returns
    ///
    /// The number of stories written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] before writing anything if a story has
    /// an empty hash or feed id, and [`StoreError::Other`] if the batch
    /// insert fails.
    pub async fn upsert_stories(&self, stories: &[Story]) -> Result<usize, StoreError> {
        if stories.is_empty() {
            return Ok(0);
        }
        for story in stories {
            validate_story(story)?;
        }

        let (_writer, mut tx) = self.begin_write().await?;

        for chunk in stories.chunks(STORY_BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO stories ({STORY_COLUMNS}) "));
            builder.push_values(chunk, |mut b, story| {
                let intel = &story.intelligence;
                b.push_bind(&story.hash)
                    .push_bind(&story.feed_id)
                    .push_bind(&story.title)
                    .push_bind(&story.permalink)
                    .push_bind(story.read)
                    .push_bind(story.saved)
                    .push_bind(story.timestamp)
                    .push_bind(i64::from(intel.version))
                    .push_bind(i64::from(intel.author))
                    .push_bind(i64::from(intel.tag))
                    .push_bind(i64::from(intel.title))
                    .push_bind(i64::from(intel.feed))
                    .push_bind(&story.content)
                    .push_bind(story.state_at);
            });
            builder.push(
                r#" ON CONFLICT(hash) DO UPDATE SET
                    feed_id = excluded.feed_id,
                    title = excluded.title,
                    permalink = excluded.permalink,
                    timestamp = excluded.timestamp,
                    intel_version = excluded.intel_version,
                    intel_author = excluded.intel_author,
                    intel_tag = excluded.intel_tag,
                    intel_title = excluded.intel_title,
                    intel_feed = excluded.intel_feed,
                    content = COALESCE(excluded.content, stories.content),
                    read = CASE WHEN excluded.state_at >= stories.state_at
                        THEN excluded.read ELSE stories.read END,
                    saved = CASE WHEN excluded.state_at >= stories.state_at
                        THEN excluded.saved ELSE stories.saved END,
                    state_at = MAX(excluded.state_at, stories.state_at)"#,
            );
            builder.build().execute(&mut *tx).await?;
        }

        for story in stories {
            write_story_images(&mut tx, &story.hash, &story.image_urls).await?;
        }

        tx.commit().await?;

        self.notify(StoreChange::Stories);
        tracing::debug!(count = stories.len(), "Upserted stories");
        Ok(stories.len())
    }

    pub async fn get_story(&self, hash: &str) -> Result<Option<Story>, StoreError> {
        let row: Option<StoryDbRow> =
            sqlx::query_as(&format!("SELECT {STORY_COLUMNS} FROM stories WHERE hash = ?"))
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let urls: Vec<(String,)> =
            sqlx::query_as("SELECT url FROM story_images WHERE story_hash = ? ORDER BY idx")
                .bind(hash)
                .fetch_all(&self.pool)
                .await?;

        Ok(Some(row.into_story(urls.into_iter().map(|(url,)| url).collect())))
    }

    /// Hashes of confirmed-unread stories in a feed, newest first.
    pub async fn query_unread_story_hashes_for_feed(
        &self,
        feed_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT hash FROM stories
            WHERE feed_id = ? AND read = 0
            ORDER BY timestamp DESC, hash
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(hash,)| hash).collect())
    }

    /// Confirmed state of a feed's stories published at or before `cutoff`.
    pub async fn feed_story_states(
        &self,
        feed_id: &str,
        cutoff: Option<i64>,
    ) -> Result<Vec<StoryState>, StoreError> {
        let rows: Vec<(String, bool, bool, i64)> = sqlx::query_as(
            r#"
            SELECT hash, read, saved, timestamp FROM stories
            WHERE feed_id = ? AND (? IS NULL OR timestamp <= ?)
            ORDER BY timestamp DESC, hash
        "#,
        )
        .bind(feed_id)
        .bind(cutoff)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(hash, read, saved, timestamp)| StoryState {
                hash,
                read,
                saved,
                timestamp,
            })
            .collect())
    }

    /// Mark a feed's stories read in the confirmed state.
    ///
    /// Only stories of `feed_id` published at or before `cutoff` are touched,
    /// restricted to `story_hashes` when it is non-empty. Each story that
    /// flips decrements its intelligence bucket in the feed's counts.
    /// Returns how many stories changed; repeating the call changes none.
    pub async fn mark_stories_read_locally(
        &self,
        story_hashes: &[String],
        feed_id: &str,
        cutoff: Option<i64>,
    ) -> Result<u64, StoreError> {
        self.apply_read_confirmation(feed_id, story_hashes, cutoff, true, now_millis())
            .await
    }

    /// Apply a server-confirmed read or unread to stored stories and keep
    /// the feed's counts in step.
    ///
    /// Stories whose flags were written after `state_at` are left alone.
    pub async fn apply_read_confirmation(
        &self,
        feed_id: &str,
        story_hashes: &[String],
        cutoff: Option<i64>,
        read: bool,
        state_at: i64,
    ) -> Result<u64, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        let changed = set_read_flags(&mut tx, feed_id, story_hashes, cutoff, read, state_at).await?;
        tx.commit().await?;

        if changed > 0 {
            self.notify(StoreChange::Stories);
            self.notify(StoreChange::Feeds);
        }
        tracing::debug!(feed_id = %feed_id, read, changed, "Applied read state");
        Ok(changed)
    }

    /// Apply a server-confirmed save or unsave.
    pub async fn apply_saved_confirmation(
        &self,
        story_hashes: &[String],
        saved: bool,
        state_at: i64,
    ) -> Result<u64, StoreError> {
        if story_hashes.is_empty() {
            return Ok(0);
        }

        let (_writer, mut tx) = self.begin_write().await?;
        let mut changed = 0;
        for chunk in story_hashes.chunks(HASH_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE stories SET saved = ");
            builder.push_bind(saved);
            builder.push(", state_at = ");
            builder.push_bind(state_at);
            builder.push(" WHERE saved <> ");
            builder.push_bind(saved);
            builder.push(" AND state_at <= ");
            builder.push_bind(state_at);
            push_hash_list(&mut builder, chunk);
            changed += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        if changed > 0 {
            self.notify(StoreChange::Stories);
        }
        Ok(changed)
    }

    /// Bring confirmed read flags in line with the server's unread list.
    ///
    /// Stories we hold as unread that the server no longer lists become
    /// read, and listed stories we hold as read become unread. Stories in
    /// `protected` (those with pending local actions) are skipped, as are
    /// stories written after `state_at`. Counts are left to the feed records.
    pub async fn reconcile_unread_hashes(
        &self,
        server_unread: &HashSet<String>,
        protected: &HashSet<String>,
        state_at: i64,
    ) -> Result<u64, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;

        let rows: Vec<(String, bool, i64)> =
            sqlx::query_as("SELECT hash, read, state_at FROM stories")
                .fetch_all(&mut *tx)
                .await?;

        let mut to_read = Vec::new();
        let mut to_unread = Vec::new();
        for (hash, read, stored_at) in rows {
            if stored_at > state_at || protected.contains(&hash) {
                continue;
            }
            match (read, server_unread.contains(&hash)) {
                (false, false) => to_read.push(hash),
                (true, true) => to_unread.push(hash),
                _ => {}
            }
        }

        let mut changed = 0;
        for (flag, hashes) in [(true, &to_read), (false, &to_unread)] {
            for chunk in hashes.chunks(HASH_CHUNK) {
                let mut builder: QueryBuilder<Sqlite> =
                    QueryBuilder::new("UPDATE stories SET read = ");
                builder.push_bind(flag);
                builder.push(", state_at = ");
                builder.push_bind(state_at);
                builder.push(" WHERE 1 = 1");
                push_hash_list(&mut builder, chunk);
                changed += builder.build().execute(&mut *tx).await?.rows_affected();
            }
        }

        tx.commit().await?;

        if changed > 0 {
            self.notify(StoreChange::Stories);
        }
        tracing::info!(
            marked_read = to_read.len(),
            marked_unread = to_unread.len(),
            "Reconciled unread stories"
        );
        Ok(changed)
    }

    /// Which of `hashes` are not stored yet.
    pub async fn missing_story_hashes(&self, hashes: &[String]) -> Result<Vec<String>, StoreError> {
        let mut present = HashSet::new();
        for chunk in hashes.chunks(HASH_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT hash FROM stories WHERE 1 = 1");
            push_hash_list(&mut builder, chunk);
            let rows: Vec<(String,)> = builder.build_query_as().fetch_all(&self.pool).await?;
            present.extend(rows.into_iter().map(|(hash,)| hash));
        }

        Ok(hashes
            .iter()
            .filter(|hash| !present.contains(*hash))
            .cloned()
            .collect())
    }

    /// Delete read, unsaved stories published before `older_than` that have
    /// no pending actions.
    pub async fn cleanup_stories(&self, older_than: i64) -> Result<u64, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM stories
            WHERE timestamp < ? AND read = 1 AND saved = 0
              AND hash NOT IN (SELECT story_hash FROM pending_actions)
        "#,
        )
        .bind(older_than)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            self.notify(StoreChange::Stories);
            tracing::info!(deleted, "Cleaned up old stories");
        }
        Ok(deleted)
    }

    /// Stories without content, newest first.
    pub async fn unfetched_story_hashes(&self, limit: u32) -> Result<Vec<StoryRef>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT feed_id, hash FROM stories
            WHERE content IS NULL
            ORDER BY timestamp DESC
            LIMIT ?
        "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(feed_id, hash)| StoryRef { feed_id, hash })
            .collect())
    }

    /// Store fetched content in one update. Read state is not touched.
    ///
    /// Returns `false` if the story is unknown or already has content.
    pub async fn store_story_content(&self, hash: &str, body: &str) -> Result<bool, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        let result =
            sqlx::query("UPDATE stories SET content = ? WHERE hash = ? AND content IS NULL")
                .bind(body)
                .bind(hash)
                .execute(&mut *tx)
                .await?;
        tx.commit().await?;

        let stored = result.rows_affected() > 0;
        if stored {
            self.notify(StoreChange::Stories);
        }
        Ok(stored)
    }

    /// Every story's hash, classifier input and confirmed read flag.
    pub async fn story_count_rows(&self) -> Result<Vec<StoryCountRow>, StoreError> {
        let rows: Vec<(String, bool, i64, i64, i64, i64, i64)> = sqlx::query_as(
            r#"
            SELECT hash, read, intel_version, intel_author, intel_tag, intel_title, intel_feed
            FROM stories
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(hash, read, version, author, tag, title, feed)| StoryCountRow {
                hash,
                intelligence: intelligence_from_columns(version, author, tag, title, feed),
                read,
            })
            .collect())
    }
}

fn push_hash_list(builder: &mut QueryBuilder<'_, Sqlite>, hashes: &[String]) {
    if hashes.is_empty() {
        return;
    }
    builder.push(" AND hash IN (");
    let mut separated = builder.separated(", ");
    for hash in hashes {
        separated.push_bind(hash.clone());
    }
    separated.push_unseparated(")");
}

/// Flip read flags for matching stories and move the feed's bucket counts.
async fn set_read_flags(
    tx: &mut Transaction<'static, Sqlite>,
    feed_id: &str,
    story_hashes: &[String],
    cutoff: Option<i64>,
    read: bool,
    state_at: i64,
) -> Result<u64, StoreError> {
    // An empty hash list means "every story of the feed".
    let chunks: Vec<&[String]> = if story_hashes.is_empty() {
        vec![story_hashes]
    } else {
        story_hashes.chunks(HASH_CHUNK).collect()
    };

    let mut candidates: Vec<CandidateRow> = Vec::new();
    for chunk in chunks {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT hash, intel_version, intel_author, intel_tag, intel_title, intel_feed \
             FROM stories WHERE feed_id = ",
        );
        builder.push_bind(feed_id.to_string());
        builder.push(" AND read <> ");
        builder.push_bind(read);
        builder.push(" AND state_at <= ");
        builder.push_bind(state_at);
        if let Some(cutoff) = cutoff {
            builder.push(" AND timestamp <= ");
            builder.push_bind(cutoff);
        }
        push_hash_list(&mut builder, chunk);

        let rows: Vec<CandidateRow> = builder.build_query_as().fetch_all(&mut **tx).await?;
        candidates.extend(rows);
    }

    if candidates.is_empty() {
        return Ok(0);
    }

    let changed: Vec<String> = candidates.iter().map(|row| row.0.clone()).collect();
    for chunk in changed.chunks(HASH_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE stories SET read = ");
        builder.push_bind(read);
        builder.push(", state_at = ");
        builder.push_bind(state_at);
        builder.push(" WHERE 1 = 1");
        push_hash_list(&mut builder, chunk);
        builder.build().execute(&mut **tx).await?;
    }

    let counts_row: Option<(i64, i64, i64)> =
        sqlx::query_as("SELECT ps, nt, ng FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&mut **tx)
            .await?;

    if let Some((ps, nt, ng)) = counts_row {
        let mut counts = counts_from_columns(ps, nt, ng);
        let step = if read { -1 } else { 1 };
        let mut per_bucket: HashMap<intelligence::Bucket, i64> = HashMap::new();
        for (_, version, author, tag, title, feed) in &candidates {
            let input = intelligence_from_columns(*version, *author, *tag, *title, *feed);
            *per_bucket.entry(intelligence::bucket(&input)).or_default() += step;
        }
        for (bucket, delta) in per_bucket {
            counts.adjust(bucket, delta);
        }

        sqlx::query("UPDATE feeds SET ps = ?, nt = ?, ng = ? WHERE id = ?")
            .bind(i64::from(counts.ps))
            .bind(i64::from(counts.nt))
            .bind(i64::from(counts.ng))
            .bind(feed_id)
            .execute(&mut **tx)
            .await?;
    }

    Ok(candidates.len() as u64)
}

async fn write_story_images(
    tx: &mut Transaction<'static, Sqlite>,
    story_hash: &str,
    urls: &[String],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM story_images WHERE story_hash = ? AND idx >= ?")
        .bind(story_hash)
        .bind(urls.len() as i64)
        .execute(&mut **tx)
        .await?;

    if urls.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO story_images (story_hash, idx, url) ");
    builder.push_values(urls.iter().enumerate(), |mut b, (idx, url)| {
        b.push_bind(story_hash.to_string())
            .push_bind(idx as i64)
            .push_bind(url.clone());
    });
    builder.push(
        r#" ON CONFLICT(story_hash, idx) DO UPDATE SET
            url = excluded.url,
            cached = CASE WHEN story_images.url = excluded.url
                THEN story_images.cached ELSE 0 END"#,
    );
    builder.build().execute(&mut **tx).await?;
    Ok(())
}
