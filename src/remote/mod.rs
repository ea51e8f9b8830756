//! The remote feed service.
//!
//! The core only talks to the server through [`RemoteService`]; [`HttpRemote`]
//! is the production implementation. Every error says whether retrying can
//! help and whether the server refused the request itself; only a refusal
//! lets the queue drop an action.

mod http;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::storage::{FeedsAndFolders, Story};

pub use http::HttpRemote;

/// Errors returned by the remote service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection, DNS, TLS or interrupted transfer
    #[error("Request failed: {0}")]
    Network(String),
    /// The attempt exceeded its deadline
    #[error("Request timed out")]
    Timeout,
    /// Unexpected HTTP status; retryable for 5xx, 408 and 429
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The session was refused (401, 403)
    #[error("Not authorized: status {0}")]
    Unauthorized(u16),
    /// The server refused this request for good (unknown story, error reply)
    #[error("Rejected by server: {0}")]
    Rejected(String),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),
    /// The target URL failed validation
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => true,
            RemoteError::HttpStatus(status) => {
                *status >= 500 || *status == 408 || *status == 429
            }
            RemoteError::Unauthorized(_)
            | RemoteError::Rejected(_)
            | RemoteError::ResponseTooLarge
            | RemoteError::Decode(_)
            | RemoteError::InvalidUrl(_) => false,
        }
    }

    /// Whether the server answered and refused the request itself.
    ///
    /// Session, decoding and transport trouble say nothing about the request,
    /// so they are never rejections.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RemoteError::Rejected(_))
    }
}

/// Operations the core needs from the feed service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn mark_stories_read(&self, feed_id: &str, story_hashes: &[String])
        -> Result<(), RemoteError>;

    async fn mark_stories_unread(
        &self,
        feed_id: &str,
        story_hashes: &[String],
    ) -> Result<(), RemoteError>;

    async fn mark_story_saved(&self, story_hash: &str) -> Result<(), RemoteError>;

    async fn mark_story_unsaved(&self, story_hash: &str) -> Result<(), RemoteError>;

    /// Full content of one story.
    async fn fetch_story_content(&self, feed_id: &str, story_hash: &str)
        -> Result<String, RemoteError>;

    /// Raw bytes of an image or favicon.
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, RemoteError>;

    /// The complete feed/folder tree with server-confirmed counts.
    async fn fetch_feeds_and_folders(&self) -> Result<FeedsAndFolders, RemoteError>;

    /// Unread story hashes grouped by feed id.
    async fn fetch_unread_story_hashes(&self) -> Result<HashMap<String, Vec<String>>, RemoteError>;

    /// Story metadata for the given hashes.
    async fn fetch_stories(&self, story_hashes: &[String]) -> Result<Vec<Story>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RemoteError::Network("reset".into()).is_retryable());
        assert!(RemoteError::Timeout.is_retryable());
        assert!(RemoteError::HttpStatus(503).is_retryable());
        assert!(RemoteError::HttpStatus(429).is_retryable());
        assert!(RemoteError::HttpStatus(408).is_retryable());
        assert!(!RemoteError::HttpStatus(404).is_retryable());
        assert!(!RemoteError::Rejected("story not found".into()).is_retryable());
        assert!(!RemoteError::ResponseTooLarge.is_retryable());
    }

    #[test]
    fn test_only_refusals_are_rejections() {
        assert!(RemoteError::Rejected("story not found".into()).is_rejection());
        assert!(!RemoteError::Unauthorized(401).is_rejection());
        assert!(!RemoteError::Unauthorized(401).is_retryable());
        assert!(!RemoteError::Decode("expected value".into()).is_rejection());
        assert!(!RemoteError::HttpStatus(400).is_rejection());
        assert!(!RemoteError::Timeout.is_rejection());
    }
}
