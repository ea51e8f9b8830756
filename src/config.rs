//! Configuration file parser for ~/.config/feedsync/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde but logged as warnings, since they are
//! usually typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::images::ImageCacheSettings;
use crate::offline::OfflineSettings;
use crate::queue::QueueSettings;

/// Environment variable that overrides `session_token`.
pub const SESSION_TOKEN_ENV: &str = "FEEDSYNC_SESSION_TOKEN";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// Every section uses `#[serde(default)]`, so any subset of keys can be given.
/// The session token is masked in `Debug` output.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the feed service.
    pub server_url: String,

    /// Opaque session token forwarded as a bearer token.
    /// `FEEDSYNC_SESSION_TOKEN` takes precedence.
    pub session_token: Option<String>,

    /// Where the database and image cache live. Defaults to the config directory.
    pub data_dir: Option<PathBuf>,

    /// Allow image URLs on loopback and private networks.
    pub allow_private_hosts: bool,

    pub queue: QueueConfig,
    pub offline: OfflineConfig,
    pub images: ImagesConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub min_flush_interval_secs: u64,
    pub attempt_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub batch_size: usize,
    pub auto_flush_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_flush_interval_secs: 5,
            attempt_timeout_secs: 30,
            backoff_base_secs: 2,
            backoff_max_secs: 300,
            batch_size: 100,
            auto_flush_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub story_workers: usize,
    pub image_workers: usize,
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
    pub retry_base_ms: u64,
    pub retry_max_secs: u64,
    pub cancel_timeout_secs: u64,
    pub max_items: u32,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            story_workers: 4,
            image_workers: 3,
            max_attempts: 5,
            attempt_timeout_secs: 30,
            retry_base_ms: 1_000,
            retry_max_secs: 30,
            cancel_timeout_secs: 5,
            max_items: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub max_megabytes: u64,
    pub max_entries: usize,
    pub memory_entries: usize,
    /// Images not viewed for this many days are removed by `sync`. 0 = never.
    pub max_age_days: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            max_megabytes: 256,
            max_entries: 10_000,
            memory_entries: 64,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Read, unsaved stories older than this are deleted by `sync`. 0 = keep all.
    pub keep_read_days: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { keep_read_days: 30 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "https://newsblur.com".to_string(),
            session_token: None,
            data_dir: None,
            allow_private_hosts: false,
            queue: QueueConfig::default(),
            offline: OfflineConfig::default(),
            images: ImagesConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("data_dir", &self.data_dir)
            .field("allow_private_hosts", &self.allow_private_hosts)
            .field("queue", &self.queue)
            .field("offline", &self.offline)
            .field("images", &self.images)
            .field("storage", &self.storage)
            .finish()
    }
}

const TOP_LEVEL_KEYS: &[&str] = &[
    "server_url",
    "session_token",
    "data_dir",
    "allow_private_hosts",
    "queue",
    "offline",
    "images",
    "storage",
];

const SECTION_KEYS: &[(&str, &[&str])] = &[
    (
        "queue",
        &[
            "min_flush_interval_secs",
            "attempt_timeout_secs",
            "backoff_base_secs",
            "backoff_max_secs",
            "batch_size",
            "auto_flush_interval_secs",
        ],
    ),
    (
        "offline",
        &[
            "story_workers",
            "image_workers",
            "max_attempts",
            "attempt_timeout_secs",
            "retry_base_ms",
            "retry_max_secs",
            "cancel_timeout_secs",
            "max_items",
        ],
    ),
    (
        "images",
        &["max_megabytes", "max_entries", "memory_entries", "max_age_days"],
    ),
    ("storage", &["keep_read_days"]),
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line information
    /// - Out-of-range values → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        tracing::info!(server = %config.server_url, "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.server_url).map_err(|e| ConfigError::Invalid {
            key: "server_url",
            reason: e.to_string(),
        })?;

        let positive: [(&'static str, u64); 6] = [
            ("queue.batch_size", self.queue.batch_size as u64),
            ("queue.attempt_timeout_secs", self.queue.attempt_timeout_secs),
            ("offline.story_workers", self.offline.story_workers as u64),
            ("offline.image_workers", self.offline.image_workers as u64),
            ("offline.max_attempts", u64::from(self.offline.max_attempts)),
            ("images.max_megabytes", self.images.max_megabytes),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.queue.backoff_base_secs > self.queue.backoff_max_secs {
            return Err(ConfigError::Invalid {
                key: "queue.backoff_base_secs",
                reason: "must not exceed queue.backoff_max_secs".to_string(),
            });
        }
        Ok(())
    }

    /// The session token, preferring the environment over the file.
    pub fn session_token(&self) -> Option<SecretString> {
        std::env::var(SESSION_TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.session_token.clone())
            .map(SecretString::from)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        let q = &self.queue;
        QueueSettings {
            min_flush_interval: Duration::from_secs(q.min_flush_interval_secs),
            attempt_timeout: Duration::from_secs(q.attempt_timeout_secs),
            backoff_base: Duration::from_secs(q.backoff_base_secs),
            backoff_max: Duration::from_secs(q.backoff_max_secs),
            batch_size: q.batch_size,
            auto_flush_interval: Duration::from_secs(q.auto_flush_interval_secs.max(1)),
        }
    }

    pub fn offline_settings(&self) -> OfflineSettings {
        let o = &self.offline;
        OfflineSettings {
            story_workers: o.story_workers,
            image_workers: o.image_workers,
            max_attempts: o.max_attempts,
            attempt_timeout: Duration::from_secs(o.attempt_timeout_secs),
            retry_base: Duration::from_millis(o.retry_base_ms),
            retry_max: Duration::from_secs(o.retry_max_secs),
            cancel_timeout: Duration::from_secs(o.cancel_timeout_secs),
            max_items: o.max_items,
        }
    }

    pub fn image_settings(&self) -> ImageCacheSettings {
        ImageCacheSettings {
            max_bytes: self.images.max_megabytes.saturating_mul(1024 * 1024),
            max_entries: self.images.max_entries,
            memory_entries: self.images.memory_entries,
        }
    }

    pub fn image_max_age(&self) -> Option<Duration> {
        (self.images.max_age_days > 0)
            .then(|| Duration::from_secs(self.images.max_age_days * 24 * 60 * 60))
    }

    pub fn keep_read(&self) -> Option<Duration> {
        (self.storage.keep_read_days > 0)
            .then(|| Duration::from_secs(self.storage.keep_read_days * 24 * 60 * 60))
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        let Some(table) = value.as_table() else {
            continue;
        };
        let Some((_, known)) = SECTION_KEYS.iter().find(|(section, _)| section == key) else {
            continue;
        };
        for inner in table.keys() {
            if !known.contains(&inner.as_str()) {
                tracing::warn!(key = %format!("{key}.{inner}"), "Unknown key in config file, ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_url, "https://newsblur.com");
        assert!(config.session_token.is_none());
        assert_eq!(config.offline.story_workers, 4);
        assert_eq!(config.offline.image_workers, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.queue.batch_size, 100);
    }

    #[test]
    fn test_whitespace_only_returns_default() {
        let config = Config::parse("   \n  \n").unwrap();
        assert_eq!(config.server_url, "https://newsblur.com");
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let config = Config::parse(
            r#"
server_url = "https://reader.example.com"

[offline]
story_workers = 2

[images]
max_megabytes = 10
"#,
        )
        .unwrap();

        assert_eq!(config.server_url, "https://reader.example.com");
        assert_eq!(config.offline.story_workers, 2);
        assert_eq!(config.offline.image_workers, 3);
        assert_eq!(config.image_settings().max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.queue_settings().batch_size, 100);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::parse("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(Config::parse("server_url = 42\n").is_err());
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::parse(
            r#"
totally_fake_key = "x"

[queue]
batch_sise = 5
"#,
        )
        .unwrap();
        assert_eq!(config.queue.batch_size, 100);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = Config::parse("[offline]\nimage_workers = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "offline.image_workers",
                ..
            }
        ));
    }

    #[test]
    fn test_bad_server_url_rejected() {
        let err = Config::parse("server_url = \"not a url\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "server_url", .. }));
    }

    #[test]
    fn test_too_large_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_debug_masks_session_token() {
        let config = Config {
            session_token: Some("super-secret-session".to_string()),
            ..Config::default()
        };

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("super-secret-session"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_session_token_from_file() {
        let config = Config {
            session_token: Some("from-file".to_string()),
            ..Config::default()
        };
        // The environment override is not set in the test environment.
        if std::env::var(SESSION_TOKEN_ENV).is_err() {
            let token = config.session_token().unwrap();
            assert_eq!(token.expose_secret(), "from-file");
        }
    }

    #[test]
    fn test_zero_days_disable_cleanup() {
        let config =
            Config::parse("[images]\nmax_age_days = 0\n[storage]\nkeep_read_days = 0\n").unwrap();
        assert!(config.image_max_age().is_none());
        assert!(config.keep_read().is_none());
    }
}
