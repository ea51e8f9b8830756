use super::schema::Store;
use super::types::{StoreChange, StoreError};
use crate::queue::{EntryKey, QueueEntry, StoryAction};

type PendingRow = (i64, String, String, String, Option<i64>, i64);

impl Store {
    // ========================================================================
    // Durable Action Queue
    // ========================================================================

    /// Persist a queue entry, replacing whatever its slot held.
    pub async fn save_pending_action(&self, entry: &QueueEntry) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO pending_actions
                (feed_id, story_hash, class, seq, action, cutoff_timestamp, enqueued_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
        )
        .bind(&entry.feed_id)
        .bind(&entry.story_hash)
        .bind(entry.action.class().as_str())
        .bind(entry.seq as i64)
        .bind(entry.action.as_str())
        .bind(entry.cutoff_timestamp)
        .bind(entry.enqueued_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.notify(StoreChange::PendingActions);
        Ok(())
    }

    /// Remove a slot. With `seq`, only if the slot still holds that entry.
    pub async fn delete_pending_action(
        &self,
        key: &EntryKey,
        seq: Option<u64>,
    ) -> Result<bool, StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM pending_actions
            WHERE feed_id = ? AND story_hash = ? AND class = ?
              AND (? IS NULL OR seq = ?)
        "#,
        )
        .bind(&key.feed_id)
        .bind(&key.story_hash)
        .bind(key.class.as_str())
        .bind(seq.map(|s| s as i64))
        .bind(seq.map(|s| s as i64))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.notify(StoreChange::PendingActions);
        }
        Ok(deleted)
    }

    /// Every persisted entry in enqueue order. Rows with an unknown action
    /// are skipped.
    pub async fn load_pending_actions(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            r#"
            SELECT seq, feed_id, story_hash, action, cutoff_timestamp, enqueued_at
            FROM pending_actions
            ORDER BY seq
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(
                |(seq, feed_id, story_hash, action, cutoff_timestamp, enqueued_at)| {
                    let Some(action) = StoryAction::parse(&action) else {
                        tracing::warn!(story_hash = %story_hash, action = %action, "Skipping pending action of unknown type");
                        return None;
                    };
                    Some(QueueEntry {
                        seq: seq.max(0) as u64,
                        feed_id,
                        story_hash,
                        action,
                        cutoff_timestamp,
                        enqueued_at,
                    })
                },
            )
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ActionClass;
    use pretty_assertions::assert_eq;

    fn entry(seq: u64, action: StoryAction) -> QueueEntry {
        QueueEntry {
            seq,
            feed_id: "42".into(),
            story_hash: "abc123".into(),
            action,
            cutoff_timestamp: Some(1_700_000_000),
            enqueued_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_save_replaces_slot() {
        let store = Store::open(":memory:").await.unwrap();
        store
            .save_pending_action(&entry(1, StoryAction::MarkRead))
            .await
            .unwrap();
        store
            .save_pending_action(&entry(2, StoryAction::MarkUnread))
            .await
            .unwrap();
        store
            .save_pending_action(&entry(3, StoryAction::MarkSaved))
            .await
            .unwrap();

        let loaded = store.load_pending_actions().await.unwrap();
        assert_eq!(
            loaded,
            vec![entry(2, StoryAction::MarkUnread), entry(3, StoryAction::MarkSaved)]
        );
    }

    #[tokio::test]
    async fn test_delete_checks_seq() {
        let store = Store::open(":memory:").await.unwrap();
        let current = entry(5, StoryAction::MarkRead);
        store.save_pending_action(&current).await.unwrap();

        let key = EntryKey {
            feed_id: "42".into(),
            story_hash: "abc123".into(),
            class: ActionClass::ReadState,
        };
        assert!(!store.delete_pending_action(&key, Some(4)).await.unwrap());
        assert!(store.delete_pending_action(&key, Some(5)).await.unwrap());
        assert!(store.load_pending_actions().await.unwrap().is_empty());
    }
}
