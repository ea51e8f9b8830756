use sqlx::{QueryBuilder, Sqlite};

use super::schema::Store;
use super::types::{CachedImageRecord, FaviconJob, StoreChange, StoreError, StoryImage};

const KEY_CHUNK: usize = 500;

impl Store {
    // ========================================================================
    // Cached Image Index
    // ========================================================================

    pub async fn upsert_cached_image(&self, record: &CachedImageRecord) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        sqlx::query(
            r#"
            INSERT INTO cached_images (key, size, tick, accessed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                size = excluded.size,
                tick = excluded.tick,
                accessed_at = excluded.accessed_at
        "#,
        )
        .bind(&record.key)
        .bind(record.size as i64)
        .bind(record.tick as i64)
        .bind(record.accessed_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.notify(StoreChange::Images);
        Ok(())
    }

    /// Persist access order for entries that are already indexed.
    pub async fn touch_cached_images(
        &self,
        records: &[CachedImageRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let (_writer, mut tx) = self.begin_write().await?;
        for record in records {
            sqlx::query("UPDATE cached_images SET tick = ?, accessed_at = ? WHERE key = ?")
                .bind(record.tick as i64)
                .bind(record.accessed_at)
                .bind(&record.key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_cached_images(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        let (_writer, mut tx) = self.begin_write().await?;
        for chunk in keys.chunks(KEY_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM cached_images WHERE key IN (");
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(key);
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        self.notify(StoreChange::Images);
        Ok(())
    }

    /// The whole index, oldest access first.
    pub async fn load_cached_images(&self) -> Result<Vec<CachedImageRecord>, StoreError> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT key, size, tick, accessed_at FROM cached_images ORDER BY tick",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(key, size, tick, accessed_at)| CachedImageRecord {
                key,
                size: size.max(0) as u64,
                tick: tick.max(0) as u64,
                accessed_at,
            })
            .collect())
    }

    /// Drop the whole index and mark every story image uncached.
    pub async fn clear_cached_images(&self) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        sqlx::query("DELETE FROM cached_images")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE story_images SET cached = 0 WHERE cached = 1")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.notify(StoreChange::Images);
        Ok(())
    }

    // ========================================================================
    // Story Images & Favicons
    // ========================================================================

    /// Story images not cached yet, newest stories first.
    pub async fn pending_story_images(&self, limit: u32) -> Result<Vec<StoryImage>, StoreError> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            r#"
            SELECT si.story_hash, si.idx, si.url
            FROM story_images si
            JOIN stories s ON s.hash = si.story_hash
            WHERE si.cached = 0
            ORDER BY s.timestamp DESC, si.idx
            LIMIT ?
        "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(story_hash, idx, url)| StoryImage {
                story_hash,
                index: u32::try_from(idx).unwrap_or_default(),
                url,
            })
            .collect())
    }

    pub async fn mark_story_image_cached(
        &self,
        story_hash: &str,
        index: u32,
        cached: bool,
    ) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        sqlx::query("UPDATE story_images SET cached = ? WHERE story_hash = ? AND idx = ?")
            .bind(cached)
            .bind(story_hash)
            .bind(i64::from(index))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Feeds with a favicon URL whose favicon is not in the image index.
    pub async fn uncached_favicons(&self) -> Result<Vec<FaviconJob>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT f.id, f.favicon_url
            FROM feeds f
            WHERE f.favicon_url IS NOT NULL AND f.favicon_url <> ''
              AND NOT EXISTS (
                  SELECT 1 FROM cached_images c WHERE c.key = 'favicon:' || f.id
              )
            ORDER BY f.id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(feed_id, url)| FaviconJob { feed_id, url })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::UnreadCounts;
    use crate::intelligence::StoryIntelligence;
    use crate::storage::{Feed, Story};
    use pretty_assertions::assert_eq;

    fn record(key: &str, tick: u64) -> CachedImageRecord {
        CachedImageRecord {
            key: key.to_string(),
            size: 10,
            tick,
            accessed_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_index_round_trip() {
        let store = Store::open(":memory:").await.unwrap();
        store.upsert_cached_image(&record("b", 2)).await.unwrap();
        store.upsert_cached_image(&record("a", 1)).await.unwrap();
        store
            .touch_cached_images(&[record("a", 3)])
            .await
            .unwrap();

        let loaded = store.load_cached_images().await.unwrap();
        assert_eq!(loaded, vec![record("b", 2), record("a", 3)]);

        store.delete_cached_images(&["b".to_string()]).await.unwrap();
        assert_eq!(store.load_cached_images().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_story_images_and_favicons() {
        let store = Store::open(":memory:").await.unwrap();
        store
            .upsert_feeds(&[Feed {
                id: "42".into(),
                title: "Feed".into(),
                favicon_url: Some("https://example.com/favicon.ico".into()),
                counts: UnreadCounts::ZERO,
                last_fetched: None,
                active: true,
            }])
            .await
            .unwrap();
        store
            .upsert_stories(&[Story {
                hash: "abc123".into(),
                feed_id: "42".into(),
                title: "Story".into(),
                permalink: None,
                read: false,
                saved: false,
                timestamp: 1,
                intelligence: StoryIntelligence::default(),
                image_urls: vec!["https://img/a.png".into(), "https://img/b.png".into()],
                content: None,
                state_at: 0,
            }])
            .await
            .unwrap();

        store.mark_story_image_cached("abc123", 0, true).await.unwrap();
        let pending = store.pending_story_images(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].index, 1);

        assert_eq!(store.uncached_favicons().await.unwrap().len(), 1);
        store
            .upsert_cached_image(&record("favicon:42", 1))
            .await
            .unwrap();
        assert!(store.uncached_favicons().await.unwrap().is_empty());
    }
}
