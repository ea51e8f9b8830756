//! Offline read-state synchronization and local cache engine for a feed reader.
//!
//! The crate keeps three sources of truth consistent:
//!
//! - **[`storage`]** - the durable SQLite store (feeds, folders, stories, the
//!   pending action queue, the cached image index)
//! - **[`queue`]** - optimistic user actions waiting for server confirmation
//! - **[`remote`]** - the eventually-consistent feed service
//!
//! On top of those sit the [`counts`] aggregator (unread counts split by
//! [`intelligence`] bucket), the [`offline`] prefetch scheduler and the
//! size-bounded [`images`] cache. [`context::SyncContext`] wires everything
//! together once at startup.

pub mod config;
pub mod context;
pub mod counts;
pub mod images;
pub mod intelligence;
pub mod offline;
pub mod queue;
pub mod remote;
pub mod storage;

pub use config::Config;
pub use context::{SyncContext, SyncError};
pub use counts::{CountError, UnreadCounter, UnreadCounts};
pub use images::{ImageCache, ImageKey};
pub use intelligence::{Bucket, IntelligenceFilter, StoryIntelligence};
pub use offline::{Connectivity, OfflineFetcher};
pub use queue::{FlushReport, ReadStateQueue, StoryAction};
pub use remote::{HttpRemote, RemoteError, RemoteService};
pub use storage::{Store, StoreError};
