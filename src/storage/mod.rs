mod feeds;
mod images;
mod pending;
mod progress;
mod schema;
mod stories;
mod types;

pub use schema::{Store, CURRENT_SCHEMA_VERSION};
pub(crate) use stories::now_millis;
pub use types::{
    normalize_folder_name, CachedImageRecord, FaviconJob, Feed, FeedsAndFolders, Folder,
    FolderChild, Progress, ProgressKind, Story, StoryCountRow, StoryImage, StoryRef, StoryState,
    StoreChange, StoreError, ROOT_FOLDER,
};
