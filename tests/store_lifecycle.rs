//! End-to-end tests through `SyncContext`: metadata sync, feed-level actions,
//! status and restart.

mod common;

use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::Arc;

use common::{feed, positive, seed_feed_42, story, Call, FakeRemote};
use feedsync::context::{ContextSettings, SyncContext};
use feedsync::intelligence::StoryIntelligence;
use feedsync::remote::RemoteError;
use feedsync::storage::{FeedsAndFolders, Folder, FolderChild, CURRENT_SCHEMA_VERSION, ROOT_FOLDER};
use feedsync::{Store, UnreadCounts};

async fn context(store: Store, remote: Arc<FakeRemote>, dir: &tempfile::TempDir) -> SyncContext {
    SyncContext::with_remote(store, remote, &dir.path().join("images"), ContextSettings::default())
        .await
        .unwrap()
}

fn server_tree() -> FeedsAndFolders {
    FeedsAndFolders {
        feeds: vec![feed("42", UnreadCounts::new(1, 1, 0))],
        folders: vec![Folder {
            name: ROOT_FOLDER.to_string(),
            children: vec![FolderChild::Feed("42".to_string())],
        }],
    }
}

#[tokio::test]
async fn test_sync_metadata_reconciles_and_fetches_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::memory_store().await;
    seed_feed_42(&store).await;

    let remote = Arc::new(FakeRemote::new());
    *remote.tree.lock().unwrap() = server_tree();
    *remote.unread.lock().unwrap() = HashMap::from([(
        "42".to_string(),
        vec!["abc123".to_string(), "new1".to_string()],
    )]);
    remote.stories.lock().unwrap().insert(
        "new1".to_string(),
        story("new1", "42", StoryIntelligence::default(), false),
    );

    let ctx = context(store.clone(), remote.clone(), &dir).await;
    let report = ctx.sync_metadata().await.unwrap();

    assert_eq!(report.feeds, 1);
    assert_eq!(report.unread_hashes, 2);
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.stories_fetched, 1);
    assert!(store.get_story("def456").await.unwrap().unwrap().read);
    assert!(!store.get_story("new1").await.unwrap().unwrap().read);
    assert!(store.get_feed("42").await.unwrap().unwrap().last_fetched.is_some());
    assert_eq!(
        remote.count(|c| matches!(c, Call::Stories(hashes) if hashes == &vec!["new1".to_string()])),
        1
    );
}

#[tokio::test]
async fn test_sync_metadata_keeps_pending_stories() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::memory_store().await;
    seed_feed_42(&store).await;

    let remote = Arc::new(FakeRemote::new());
    *remote.tree.lock().unwrap() = server_tree();
    *remote.unread.lock().unwrap() =
        HashMap::from([("42".to_string(), vec!["abc123".to_string()])]);

    let ctx = context(store.clone(), remote, &dir).await;
    ctx.mark_story_saved("42", "def456").await.unwrap();

    let report = ctx.sync_metadata().await.unwrap();
    assert_eq!(report.reconciled, 0);
    assert!(!store.get_story("def456").await.unwrap().unwrap().read);
}

#[tokio::test]
async fn test_mark_feed_read_respects_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::memory_store().await;
    store
        .upsert_feeds(&[feed("42", UnreadCounts::new(2, 1, 0))])
        .await
        .unwrap();
    let mut old = story("old", "42", positive(), false);
    old.timestamp = 100;
    let mut older = story("older", "42", StoryIntelligence::default(), false);
    older.timestamp = 50;
    let mut new = story("new", "42", positive(), false);
    new.timestamp = 1_000;
    store.upsert_stories(&[old, older, new]).await.unwrap();

    let ctx = context(store, Arc::new(FakeRemote::new()), &dir).await;
    let queued = ctx.mark_feed_read("42", Some(100)).await.unwrap();

    assert_eq!(queued, 2);
    assert_eq!(ctx.counter().split_unread_count("42"), UnreadCounts::new(1, 0, 0));

    // Already observed read: nothing more to queue.
    assert_eq!(ctx.mark_feed_read("42", Some(100)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_status_reports_counts_and_queue() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::memory_store().await;
    seed_feed_42(&store).await;

    let ctx = context(store, Arc::new(FakeRemote::new()), &dir).await;
    ctx.mark_story_read("42", "abc123").await.unwrap();

    let status = ctx.status().await.unwrap();
    assert_eq!(status.account, UnreadCounts::new(0, 1, 0));
    assert_eq!(status.root, Some(UnreadCounts::new(0, 1, 0)));
    assert_eq!(status.pending_actions, 1);
    assert_eq!(status.feeds.len(), 1);
    assert_eq!(status.feeds[0].counts.total(), 1);
    assert!(status.online);
}

#[tokio::test]
async fn test_flush_through_context_updates_counts() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::memory_store().await;
    seed_feed_42(&store).await;

    let ctx = context(store.clone(), Arc::new(FakeRemote::new()), &dir).await;
    ctx.mark_story_read("42", "abc123").await.unwrap();
    let report = ctx.flush(true).await;

    assert_eq!(report.acknowledged, 1);
    assert_eq!(ctx.counter().split_unread_count("42"), UnreadCounts::new(0, 1, 0));
    let feed = store.get_feed("42").await.unwrap().unwrap();
    assert_eq!(feed.counts, UnreadCounts::new(0, 1, 0));
}

#[tokio::test]
async fn test_context_restart_keeps_queue_and_schema() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("feedsync.db");

    {
        let store = Store::open(db.to_str().unwrap()).await.unwrap();
        seed_feed_42(&store).await;
        let remote = Arc::new(FakeRemote::new());
        remote.fail_next(
            "mark_stories_read",
            RemoteError::Network("offline".to_string()),
            10,
        );
        let ctx = context(store, remote, &dir).await;
        ctx.start_background();
        ctx.mark_story_read("42", "abc123").await.unwrap();
        ctx.shutdown().await;
    }

    let store = Store::open(db.to_str().unwrap()).await.unwrap();
    assert_eq!(store.schema_version().await.unwrap(), CURRENT_SCHEMA_VERSION);
    let ctx = context(store, Arc::new(FakeRemote::new()), &dir).await;
    assert_eq!(ctx.queue().len(), 1);
    assert_eq!(ctx.counter().unread_count("42"), 1);
}
