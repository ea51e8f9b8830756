use super::schema::Store;
use super::types::{Progress, ProgressKind, StoreChange, StoreError};

impl Store {
    // ========================================================================
    // Offline Fetch Counters
    // ========================================================================

    /// Start a new count: `remaining` resets to `total`.
    pub async fn set_offline_progress(
        &self,
        kind: ProgressKind,
        total: u64,
    ) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        sqlx::query(
            r#"
            INSERT INTO offline_progress (kind, total, remaining) VALUES (?, ?, ?)
            ON CONFLICT(kind) DO UPDATE SET total = excluded.total, remaining = excluded.remaining
        "#,
        )
        .bind(kind.as_str())
        .bind(total as i64)
        .bind(total as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.notify(StoreChange::Progress);
        Ok(())
    }

    /// One item done. Never goes below zero.
    pub async fn decrement_offline_remaining(&self, kind: ProgressKind) -> Result<(), StoreError> {
        let (_writer, mut tx) = self.begin_write().await?;
        sqlx::query(
            "UPDATE offline_progress SET remaining = MAX(remaining - 1, 0) WHERE kind = ?",
        )
        .bind(kind.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.notify(StoreChange::Progress);
        Ok(())
    }

    pub async fn offline_progress(&self, kind: ProgressKind) -> Result<Progress, StoreError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT total, remaining FROM offline_progress WHERE kind = ?")
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(total, remaining)| Progress {
                total: total.max(0) as u64,
                remaining: remaining.max(0) as u64,
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_counts_down_and_clamps() {
        let store = Store::open(":memory:").await.unwrap();
        assert_eq!(
            store.offline_progress(ProgressKind::Stories).await.unwrap(),
            Progress::default()
        );

        store
            .set_offline_progress(ProgressKind::Stories, 1)
            .await
            .unwrap();
        store
            .decrement_offline_remaining(ProgressKind::Stories)
            .await
            .unwrap();
        store
            .decrement_offline_remaining(ProgressKind::Stories)
            .await
            .unwrap();

        let progress = store.offline_progress(ProgressKind::Stories).await.unwrap();
        assert_eq!(progress.total, 1);
        assert_eq!(progress.remaining, 0);
        assert_eq!(
            store.offline_progress(ProgressKind::Images).await.unwrap(),
            Progress::default()
        );
    }
}
