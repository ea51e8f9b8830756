use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use feedsync::context::{SyncContext, SyncError, DATABASE_FILE};
use feedsync::queue::FlushReport;
use feedsync::{Config, StoreError};

/// Get the config directory path (~/.config/feedsync/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsync"))
}

/// Create a directory readable only by the current user.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(dir, perms) {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Failed to set directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to read directory metadata");
            }
        }
    }
    Ok(())
}

/// Delete the database and its WAL side files.
fn reset_database(data_dir: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let path = data_dir.join(format!("{DATABASE_FILE}{suffix}"));
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete '{}'", path.display()))?;
        }
    }
    println!("Database reset.");
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "feedsync",
    about = "Offline read-state sync and local cache for a feed reader"
)]
struct Args {
    /// Config file (default: ~/.config/feedsync/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory for the database and image cache
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show unread counts, pending actions and cache usage
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Pull metadata, flush pending actions and prefetch for offline use
    Sync {
        /// Skip the offline prefetch
        #[arg(long)]
        no_prefetch: bool,
    },
    /// Send pending actions now
    Flush,
    /// Mark one story, or every story of a feed, as read
    MarkRead {
        #[arg(long)]
        feed: String,
        #[arg(long, conflicts_with = "cutoff")]
        story: Option<String>,
        /// Only stories published at or before this unix timestamp
        #[arg(long)]
        cutoff: Option<i64>,
    },
    /// Mark one story as unread
    MarkUnread {
        #[arg(long)]
        feed: String,
        #[arg(long)]
        story: String,
    },
    /// Fetch story content and images for offline reading
    Prefetch,
    /// Empty the image cache
    ClearImages,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;

    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| config.data_dir.clone())
        .unwrap_or(config_dir);
    ensure_private_dir(&data_dir)?;

    if args.reset_db {
        reset_database(&data_dir)?;
    }

    let ctx = match SyncContext::open(&config, &data_dir).await {
        Ok(ctx) => ctx,
        Err(SyncError::Store(StoreError::InstanceLocked)) => {
            eprintln!(
                "Error: Another instance of feedsync appears to be running. \
                 Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(SyncError::Store(e)) if e.is_recoverable_by_reset() => {
            eprintln!("Error: {e}");
            eprintln!(
                "The local database cannot be used. \
                 Run with --reset-db to rebuild it from the server."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("Failed to open data directory"),
    };

    let result = run(&ctx, args.command).await;
    ctx.shutdown().await;
    result
}

async fn run(ctx: &SyncContext, command: Command) -> Result<()> {
    match command {
        Command::Status { json } => {
            let status = ctx.status().await.context("Failed to read status")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }

            println!(
                "Unread: {} (focus {}, neutral {}, hidden {})",
                status.account.total(),
                status.account.ps,
                status.account.nt,
                status.account.ng
            );
            for feed in &status.feeds {
                println!("  {:>6}  {}  [{}]", feed.counts.total(), feed.title, feed.id);
            }
            println!("Pending actions: {}", status.pending_actions);
            println!(
                "Offline: stories {}/{} remaining, images {}/{} remaining",
                status.offline.stories.remaining,
                status.offline.stories.total,
                status.offline.images.remaining,
                status.offline.images.total
            );
            println!(
                "Image cache: {} images, {} of {} bytes",
                status.images.entries, status.images.bytes, status.images.max_bytes
            );
        }
        Command::Sync { no_prefetch } => {
            let report = ctx.sync_metadata().await.context("Metadata sync failed")?;
            println!(
                "Synced {} feeds: {} unread, {} reconciled, {} stories fetched",
                report.feeds, report.unread_hashes, report.reconciled, report.stories_fetched
            );
            print_flush(&ctx.flush(true).await);

            if !no_prefetch {
                prefetch(ctx).await?;
            }
        }
        Command::Flush => print_flush(&ctx.flush(true).await),
        Command::MarkRead {
            feed,
            story,
            cutoff,
        } => {
            match story {
                Some(story) => {
                    ctx.mark_story_read(&feed, &story).await?;
                    println!("Queued: mark {story} read");
                }
                None => {
                    let queued = ctx.mark_feed_read(&feed, cutoff).await?;
                    println!("Queued {queued} stories in feed {feed} as read");
                }
            }
            print_flush(&ctx.flush(true).await);
        }
        Command::MarkUnread { feed, story } => {
            ctx.mark_story_unread(&feed, &story).await?;
            println!("Queued: mark {story} unread");
            print_flush(&ctx.flush(true).await);
        }
        Command::Prefetch => prefetch(ctx).await?,
        Command::ClearImages => {
            let removed = ctx
                .images()
                .remove_all()
                .await
                .context("Failed to clear image cache")?;
            println!("Removed {removed} cached images");
        }
    }
    Ok(())
}

async fn prefetch(ctx: &SyncContext) -> Result<()> {
    if !ctx
        .start_offline_fetch()
        .await
        .context("Failed to start offline fetch")?
    {
        println!("Offline fetch already running");
        return Ok(());
    }

    let summary = tokio::select! {
        summary = ctx.fetcher().wait() => summary,
        _ = tokio::signal::ctrl_c() => {
            println!("Cancelling...");
            ctx.cancel_offline_fetch().await;
            None
        }
    };

    if let Some(summary) = summary {
        println!(
            "Fetched {} stories and {} images ({} stories, {} images failed)",
            summary.stories_fetched,
            summary.images_fetched,
            summary.stories_failed,
            summary.images_failed
        );
    }
    Ok(())
}

fn print_flush(report: &FlushReport) {
    if report.skipped {
        println!("Flush skipped; {} actions pending", report.remaining);
        return;
    }
    println!(
        "Sent {} actions ({} rejected), {} still pending",
        report.acknowledged, report.rejected, report.remaining
    );
    if let Some(e) = &report.error {
        println!("Server unreachable, will retry: {e}");
    }
}
