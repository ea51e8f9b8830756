use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::collections::{HashMap, HashSet};

use super::schema::Store;
use super::types::{
    normalize_folder_name, validate_feed, validate_folder, Feed, FeedsAndFolders, Folder,
    FolderChild, StoreChange, StoreError,
};
use crate::counts::UnreadCounts;

/// Rows per multi-row INSERT; keeps bind counts well under SQLite's limit.
const BATCH_SIZE: usize = 100;

type FeedRow = (String, String, Option<String>, i64, i64, i64, Option<i64>, bool);

fn feed_from_row(row: FeedRow) -> Feed {
    let (id, title, favicon_url, ps, nt, ng, last_fetched, active) = row;
    Feed {
        id,
        title,
        favicon_url,
        counts: counts_from_columns(ps, nt, ng),
        last_fetched,
        active,
    }
}

pub(crate) fn counts_from_columns(ps: i64, nt: i64, ng: i64) -> UnreadCounts {
    let narrow = |v: i64| v.clamp(0, i64::from(u32::MAX)) as u32;
    UnreadCounts::new(narrow(ps), narrow(nt), narrow(ng))
}

impl Store {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Insert or replace feeds by id, all-or-nothing.
    ///
    /// `last_fetched` is local bookkeeping and survives the replace.
    ///
    /// # Arguments
    ///
    /// * `feeds` - Feed records with their server-confirmed unread counts
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] if any feed has an empty id, in which
    /// case nothing is written, or [`StoreError::Other`] if the transaction
    /// fails.
    pub async fn upsert_feeds(&self, feeds: &[Feed]) -> Result<(), StoreError> {
        if feeds.is_empty() {
            return Ok(());
        }
        for feed in feeds {
            validate_feed(feed)?;
        }

        let (_writer, mut tx) = self.begin_write().await?;
        write_feeds(&mut tx, feeds).await?;
        tx.commit().await?;

        self.notify(StoreChange::Feeds);
        tracing::debug!(count = feeds.len(), "Upserted feeds");
        Ok(())
    }

    /// Insert or replace folders by name, all-or-nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] if a folder lists a feed with an empty
    /// id; nothing is written in that case.
    pub async fn upsert_folders(&self, folders: &[Folder]) -> Result<(), StoreError> {
        if folders.is_empty() {
            return Ok(());
        }
        for folder in folders {
            validate_folder(folder)?;
        }

        let (_writer, mut tx) = self.begin_write().await?;
        for folder in folders {
            write_folder(&mut tx, folder).await?;
        }
        tx.commit().await?;

        self.notify(StoreChange::Feeds);
        Ok(())
    }

    /// Swap in a complete feed/folder tree from a metadata sync.
    ///
    /// Feeds listed in no folder are ignored, children that reference unknown
    /// feeds or folders are dropped, and feeds missing from the snapshot are
    /// deleted along with their stories. Returns the number of feeds kept.
    pub async fn replace_feeds_and_folders(
        &self,
        snapshot: &FeedsAndFolders,
    ) -> Result<usize, StoreError> {
        for feed in &snapshot.feeds {
            validate_feed(feed)?;
        }
        for folder in &snapshot.folders {
            validate_folder(folder)?;
        }

        let folder_names: HashSet<&str> = snapshot
            .folders
            .iter()
            .map(|f| normalize_folder_name(&f.name))
            .collect();
        let feed_ids: HashSet<&str> = snapshot.feeds.iter().map(|f| f.id.as_str()).collect();

        let folders: Vec<Folder> = snapshot
            .folders
            .iter()
            .map(|folder| Folder {
                name: normalize_folder_name(&folder.name).to_string(),
                children: folder
                    .children
                    .iter()
                    .filter_map(|child| match child {
                        FolderChild::Feed(id) if feed_ids.contains(id.as_str()) => {
                            Some(FolderChild::Feed(id.clone()))
                        }
                        FolderChild::Folder(name)
                            if folder_names.contains(normalize_folder_name(name)) =>
                        {
                            Some(FolderChild::Folder(normalize_folder_name(name).to_string()))
                        }
                        dangling => {
                            tracing::debug!(folder = %folder.name, child = ?dangling, "Dropping dangling folder child");
                            None
                        }
                    })
                    .collect(),
            })
            .collect();

        let foldered: HashSet<&str> = folders
            .iter()
            .flat_map(|f| f.children.iter())
            .filter_map(|child| match child {
                FolderChild::Feed(id) => Some(id.as_str()),
                FolderChild::Folder(_) => None,
            })
            .collect();

        let feeds: Vec<Feed> = snapshot
            .feeds
            .iter()
            .filter(|feed| {
                let kept = foldered.contains(feed.id.as_str());
                if !kept {
                    tracing::warn!(feed_id = %feed.id, "Ignoring feed that belongs to no folder");
                }
                kept
            })
            .cloned()
            .collect();

        let (_writer, mut tx) = self.begin_write().await?;

        let existing: Vec<(String,)> = sqlx::query_as("SELECT id FROM feeds")
            .fetch_all(&mut *tx)
            .await?;
        let kept: HashSet<&str> = feeds.iter().map(|f| f.id.as_str()).collect();
        let removed: Vec<String> = existing
            .into_iter()
            .map(|(id,)| id)
            .filter(|id| !kept.contains(id.as_str()))
            .collect();

        for chunk in removed.chunks(BATCH_SIZE) {
            delete_by_ids(&mut tx, "DELETE FROM stories WHERE feed_id IN (", chunk).await?;
            delete_by_ids(&mut tx, "DELETE FROM feeds WHERE id IN (", chunk).await?;
        }

        sqlx::query("DELETE FROM folder_children")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM folders").execute(&mut *tx).await?;

        write_feeds(&mut tx, &feeds).await?;
        for folder in &folders {
            write_folder(&mut tx, folder).await?;
        }

        tx.commit().await?;

        self.notify(StoreChange::Feeds);
        if !removed.is_empty() {
            self.notify(StoreChange::Stories);
        }
        tracing::info!(
            feeds = feeds.len(),
            folders = folders.len(),
            removed = removed.len(),
            "Replaced feed tree"
        );
        Ok(feeds.len())
    }

    /// All feeds ordered by title.
    pub async fn get_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let rows: Vec<FeedRow> = sqlx::query_as(
            r#"
            SELECT id, title, favicon_url, ps, nt, ng, last_fetched, active
            FROM feeds
            ORDER BY title COLLATE NOCASE, id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(feed_from_row).collect())
    }

    pub async fn get_feed(&self, feed_id: &str) -> Result<Option<Feed>, StoreError> {
        let row: Option<FeedRow> = sqlx::query_as(
            r#"
            SELECT id, title, favicon_url, ps, nt, ng, last_fetched, active
            FROM feeds
            WHERE id = ?
        "#,
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(feed_from_row))
    }

    /// Server-confirmed counts for every feed.
    pub async fn feed_counts(&self) -> Result<HashMap<String, UnreadCounts>, StoreError> {
        let rows: Vec<(String, i64, i64, i64)> =
            sqlx::query_as("SELECT id, ps, nt, ng FROM feeds")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, ps, nt, ng)| (id, counts_from_columns(ps, nt, ng)))
            .collect())
    }

    /// Every folder with its children in stored order.
    pub async fn folder_tree(&self) -> Result<Vec<Folder>, StoreError> {
        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM folders ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT folder, child_feed, child_folder
            FROM folder_children
            ORDER BY folder, position
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut children: HashMap<String, Vec<FolderChild>> = HashMap::new();
        for (folder, child_feed, child_folder) in rows {
            let child = match (child_feed, child_folder) {
                (Some(feed), _) => FolderChild::Feed(feed),
                (None, Some(name)) => FolderChild::Folder(name),
                (None, None) => continue,
            };
            children.entry(folder).or_default().push(child);
        }

        Ok(names
            .into_iter()
            .map(|(name,)| {
                let children = children.remove(&name).unwrap_or_default();
                Folder { name, children }
            })
            .collect())
    }

    /// Record when the feeds' stories were last pulled. Returns how many
    /// known feeds were updated; unknown ids are ignored.
    pub async fn update_feeds_fetched(
        &self,
        feed_ids: &[String],
        at: i64,
    ) -> Result<u64, StoreError> {
        if feed_ids.is_empty() {
            return Ok(0);
        }

        let (_writer, mut tx) = self.begin_write().await?;
        let mut updated = 0;
        for chunk in feed_ids.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("UPDATE feeds SET last_fetched = ");
            builder.push_bind(at);
            builder.push(" WHERE id IN (");
            let mut ids = builder.separated(", ");
            for id in chunk {
                ids.push_bind(id);
            }
            ids.push_unseparated(")");
            updated += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        if updated > 0 {
            self.notify(StoreChange::Feeds);
        }
        Ok(updated)
    }
}

async fn write_feeds(
    tx: &mut Transaction<'static, Sqlite>,
    feeds: &[Feed],
) -> Result<(), StoreError> {
    for chunk in feeds.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO feeds (id, title, favicon_url, ps, nt, ng, last_fetched, active) ",
        );
        builder.push_values(chunk, |mut b, feed| {
            b.push_bind(&feed.id)
                .push_bind(&feed.title)
                .push_bind(&feed.favicon_url)
                .push_bind(i64::from(feed.counts.ps))
                .push_bind(i64::from(feed.counts.nt))
                .push_bind(i64::from(feed.counts.ng))
                .push_bind(feed.last_fetched)
                .push_bind(feed.active);
        });
        builder.push(
            r#" ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                favicon_url = excluded.favicon_url,
                ps = excluded.ps,
                nt = excluded.nt,
                ng = excluded.ng,
                active = excluded.active,
                last_fetched = COALESCE(excluded.last_fetched, feeds.last_fetched)"#,
        );
        builder.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn write_folder(
    tx: &mut Transaction<'static, Sqlite>,
    folder: &Folder,
) -> Result<(), StoreError> {
    let name = normalize_folder_name(&folder.name);

    sqlx::query("INSERT INTO folders (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM folder_children WHERE folder = ?")
        .bind(name)
        .execute(&mut **tx)
        .await?;

    if folder.children.is_empty() {
        return Ok(());
    }

    let positioned: Vec<(i64, &FolderChild)> = folder
        .children
        .iter()
        .enumerate()
        .map(|(i, child)| (i as i64, child))
        .collect();

    for chunk in positioned.chunks(BATCH_SIZE) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO folder_children (folder, position, child_feed, child_folder) ",
        );
        builder.push_values(chunk, |mut b, (position, child)| {
            let (feed, sub) = match child {
                FolderChild::Feed(id) => (Some(id.as_str()), None),
                FolderChild::Folder(sub) => (None, Some(normalize_folder_name(sub))),
            };
            b.push_bind(name)
                .push_bind(*position)
                .push_bind(feed)
                .push_bind(sub);
        });
        builder.build().execute(&mut **tx).await?;
    }
    Ok(())
}

async fn delete_by_ids(
    tx: &mut Transaction<'static, Sqlite>,
    prefix: &str,
    ids: &[String],
) -> Result<(), StoreError> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(prefix);
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_store() -> Store {
        Store::open(":memory:").await.unwrap()
    }

    fn feed(id: &str, counts: UnreadCounts) -> Feed {
        Feed {
            id: id.to_string(),
            title: format!("Feed {id}"),
            favicon_url: None,
            counts,
            last_fetched: None,
            active: true,
        }
    }

    #[tokio::test]
    async fn test_upsert_feeds_replaces_by_id() {
        let store = test_store().await;
        store
            .upsert_feeds(&[feed("42", UnreadCounts::new(1, 2, 3))])
            .await
            .unwrap();
        let updated = store
            .update_feeds_fetched(&["42".to_string(), "missing".to_string()], 1_700_000_000)
            .await
            .unwrap();
        assert_eq!(updated, 1);
        store
            .upsert_feeds(&[feed("42", UnreadCounts::new(0, 5, 0))])
            .await
            .unwrap();

        let stored = store.get_feed("42").await.unwrap().unwrap();
        assert_eq!(stored.counts, UnreadCounts::new(0, 5, 0));
        assert_eq!(stored.last_fetched, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_invalid_feed_rejects_whole_batch() {
        let store = test_store().await;
        let result = store
            .upsert_feeds(&[feed("1", UnreadCounts::ZERO), feed(" ", UnreadCounts::ZERO)])
            .await;

        assert!(matches!(result, Err(StoreError::Invalid(_))));
        assert!(store.get_feeds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_folder_tree_round_trip_keeps_order() {
        let store = test_store().await;
        store
            .upsert_folders(&[Folder {
                name: String::new(),
                children: vec![
                    FolderChild::Feed("2".into()),
                    FolderChild::Folder("Tech".into()),
                    FolderChild::Feed("1".into()),
                ],
            }])
            .await
            .unwrap();

        let tree = store.folder_tree().await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].name, crate::storage::ROOT_FOLDER);
        assert_eq!(
            tree[0].children,
            vec![
                FolderChild::Feed("2".into()),
                FolderChild::Folder("Tech".into()),
                FolderChild::Feed("1".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_replace_ignores_unfoldered_feeds_and_dangling_children() {
        let store = test_store().await;
        store
            .upsert_feeds(&[feed("old", UnreadCounts::new(0, 1, 0))])
            .await
            .unwrap();

        let snapshot = FeedsAndFolders {
            feeds: vec![
                feed("1", UnreadCounts::new(0, 1, 0)),
                feed("orphan", UnreadCounts::new(0, 9, 0)),
            ],
            folders: vec![
                Folder {
                    name: String::new(),
                    children: vec![
                        FolderChild::Feed("1".into()),
                        FolderChild::Feed("missing".into()),
                        FolderChild::Folder("Nowhere".into()),
                    ],
                },
            ],
        };

        let kept = store.replace_feeds_and_folders(&snapshot).await.unwrap();
        assert_eq!(kept, 1);

        let ids: Vec<String> = store
            .get_feeds()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["1".to_string()]);

        let tree = store.folder_tree().await.unwrap();
        assert_eq!(tree[0].children, vec![FolderChild::Feed("1".into())]);
    }

    #[tokio::test]
    async fn test_feed_counts() {
        let store = test_store().await;
        store
            .upsert_feeds(&[
                feed("1", UnreadCounts::new(1, 0, 0)),
                feed("2", UnreadCounts::new(0, 0, 4)),
            ])
            .await
            .unwrap();

        let counts = store.feed_counts().await.unwrap();
        assert_eq!(counts["1"], UnreadCounts::new(1, 0, 0));
        assert_eq!(counts["2"], UnreadCounts::new(0, 0, 4));
    }
}
