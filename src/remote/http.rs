use async_trait::async_trait;
use futures::StreamExt;
use reqwest::redirect::Policy;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use url::{Host, Url};

use super::{RemoteError, RemoteService};
use crate::storage::{FeedsAndFolders, Story};

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_IMAGE_SIZE: usize = 5 * 1024 * 1024; // 5MB
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct ContentResponse {
    content: String,
}

#[derive(Deserialize)]
struct UnreadHashesResponse {
    #[serde(default)]
    unread_feed_story_hashes: HashMap<String, Vec<String>>,
}

#[derive(Deserialize)]
struct StoriesResponse {
    #[serde(default)]
    stories: Vec<Story>,
}

/// [`RemoteService`] over HTTP with JSON bodies.
///
/// The session token is only ever sent to the service's own host; image
/// fetches go to arbitrary hosts without it.
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: Url,
    session_token: Option<SecretString>,
    request_timeout: Duration,
    allow_private_hosts: bool,
}

impl HttpRemote {
    pub fn new(base_url: &str, session_token: Option<SecretString>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Self::with_client(client, base_url, session_token)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        session_token: Option<SecretString>,
    ) -> Result<Self, RemoteError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(RemoteError::InvalidUrl(format!(
                "unsupported scheme: {}",
                base_url.scheme()
            )));
        }
        // Url::join drops the last path segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            session_token,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            allow_private_hosts: false,
        })
    }

    /// Deadline for one request, including reading the body.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allow image URLs on loopback and private networks.
    pub fn with_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::InvalidUrl(e.to_string()))
    }

    /// Parse an image link taken from story content.
    ///
    /// Only http(s) is fetched, and unless private hosts are allowed, links to
    /// loopback, link-local or private-range hosts are refused so feed content
    /// cannot reach services on the reader's network.
    fn image_url(&self, raw: &str) -> Result<Url, RemoteError> {
        let url = Url::parse(raw).map_err(|e| RemoteError::InvalidUrl(format!("{raw}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RemoteError::InvalidUrl(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        if self.allow_private_hosts {
            return Ok(url);
        }

        let internal = match url.host() {
            Some(Host::Domain(name)) => {
                name.eq_ignore_ascii_case("localhost") || name.ends_with(".localhost")
            }
            Some(Host::Ipv4(ip)) => is_internal_ip(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => is_internal_ip(IpAddr::V6(ip)),
            None => true,
        };
        if internal {
            return Err(RemoteError::InvalidUrl(format!(
                "private host refused: {}",
                url.host_str().unwrap_or_default()
            )));
        }
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.session_token {
            Some(token) => {
                tracing::trace!("Session token attached");
                request.header(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", token.expose_secret()),
                )
            }
            None => request,
        }
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<(), RemoteError> {
        let body = serde_json::to_vec(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
        let request = self
            .authorized(self.client.post(self.endpoint(path)?))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);

        let bytes = self.send(request, MAX_RESPONSE_SIZE).await?;
        decode::<serde_json::Value>(&bytes).map(|_| ())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
        let request = self
            .authorized(self.client.get(url))
            .header(reqwest::header::ACCEPT, "application/json");
        let bytes = self.send(request, MAX_RESPONSE_SIZE).await?;
        decode(&bytes)
    }

    /// Send a request and read the body, all under one deadline.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        limit: usize,
    ) -> Result<Vec<u8>, RemoteError> {
        let attempt = async {
            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();
            if !status.is_success() {
                return Err(status_error(status.as_u16()));
            }
            read_limited_bytes(response, limit).await
        };

        tokio::time::timeout(self.request_timeout, attempt)
            .await
            .map_err(|_| RemoteError::Timeout)?
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn mark_stories_read(
        &self,
        feed_id: &str,
        story_hashes: &[String],
    ) -> Result<(), RemoteError> {
        self.post_json(
            "reader/mark_story_hashes_as_read",
            &serde_json::json!({ "feed_id": feed_id, "story_hashes": story_hashes }),
        )
        .await
    }

    async fn mark_stories_unread(
        &self,
        feed_id: &str,
        story_hashes: &[String],
    ) -> Result<(), RemoteError> {
        self.post_json(
            "reader/mark_story_hashes_as_unread",
            &serde_json::json!({ "feed_id": feed_id, "story_hashes": story_hashes }),
        )
        .await
    }

    async fn mark_story_saved(&self, story_hash: &str) -> Result<(), RemoteError> {
        self.post_json(
            "reader/mark_story_hash_as_starred",
            &serde_json::json!({ "story_hash": story_hash }),
        )
        .await
    }

    async fn mark_story_unsaved(&self, story_hash: &str) -> Result<(), RemoteError> {
        self.post_json(
            "reader/mark_story_hash_as_unstarred",
            &serde_json::json!({ "story_hash": story_hash }),
        )
        .await
    }

    async fn fetch_story_content(
        &self,
        feed_id: &str,
        story_hash: &str,
    ) -> Result<String, RemoteError> {
        let mut url = self.endpoint("reader/story_content")?;
        url.query_pairs_mut()
            .append_pair("feed_id", feed_id)
            .append_pair("story_hash", story_hash);

        let response: ContentResponse = self.get_json(url).await?;
        Ok(response.content)
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let url = self.image_url(url)?;

        let bytes = self.send(self.client.get(url), MAX_IMAGE_SIZE).await?;
        if bytes.is_empty() {
            return Err(RemoteError::Decode("empty image body".to_string()));
        }
        Ok(bytes)
    }

    async fn fetch_feeds_and_folders(&self) -> Result<FeedsAndFolders, RemoteError> {
        self.get_json(self.endpoint("reader/feeds")?).await
    }

    async fn fetch_unread_story_hashes(&self) -> Result<HashMap<String, Vec<String>>, RemoteError> {
        let response: UnreadHashesResponse = self
            .get_json(self.endpoint("reader/unread_story_hashes")?)
            .await?;
        Ok(response.unread_feed_story_hashes)
    }

    async fn fetch_stories(&self, story_hashes: &[String]) -> Result<Vec<Story>, RemoteError> {
        if story_hashes.is_empty() {
            return Ok(Vec::new());
        }

        let mut url = self.endpoint("reader/river_stories")?;
        {
            let mut pairs = url.query_pairs_mut();
            for hash in story_hashes {
                pairs.append_pair("h", hash);
            }
        }

        let response: StoriesResponse = self.get_json(url).await?;
        Ok(response.stories)
    }
}

/// Decode a JSON body, turning `{"result": "error"}` replies into rejections.
fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RemoteError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| RemoteError::Decode(e.to_string()))?;

    if value.get("result").and_then(|r| r.as_str()) == Some("error") {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unspecified error");
        return Err(RemoteError::Rejected(message.to_string()));
    }

    serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(err.to_string())
    }
}

/// Only "no such thing" statuses refuse the request itself; a refused
/// session or a malformed request is kept and retried later.
fn status_error(status: u16) -> RemoteError {
    match status {
        401 | 403 => RemoteError::Unauthorized(status),
        404 | 410 => RemoteError::Rejected(format!("HTTP {status}")),
        _ => RemoteError::HttpStatus(status),
    }
}

fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_internal_ip(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local, fe80::/10 link local
                || first & 0xfe00 == 0xfc00
                || first & 0xffc0 == 0xfe80
        }
    }
}

/// Up to 3 redirects, no loops.
fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        for prev in attempt.previous() {
            if prev.as_str() == url.as_str() {
                return attempt.error("Redirect loop detected");
            }
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, RemoteError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(RemoteError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(transport_error)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(RemoteError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // A short body means the transfer was cut off; worth retrying.
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(RemoteError::Network(format!(
                "incomplete response: expected {expected} bytes, received {}",
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_envelope_is_rejection() {
        let result: Result<serde_json::Value, _> =
            decode(br#"{"result": "error", "message": "story not found"}"#);
        assert_eq!(
            result,
            Err(RemoteError::Rejected("story not found".to_string()))
        );
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let result: Result<serde_json::Value, _> = decode(b"<html>");
        assert!(matches!(result, Err(RemoteError::Decode(_))));
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(status_error(503), RemoteError::HttpStatus(503));
        assert_eq!(status_error(429), RemoteError::HttpStatus(429));
        assert!(matches!(status_error(404), RemoteError::Rejected(_)));
        assert!(matches!(status_error(410), RemoteError::Rejected(_)));
        assert_eq!(status_error(401), RemoteError::Unauthorized(401));
        assert_eq!(status_error(403), RemoteError::Unauthorized(403));
        assert_eq!(status_error(400), RemoteError::HttpStatus(400));
        assert!(!status_error(400).is_retryable());
    }

    #[test]
    fn test_image_url_accepts_public_http() {
        let remote = HttpRemote::new("https://reader.example.com", None).unwrap();
        let url = remote.image_url("https://cdn.example.com/a.png").unwrap();
        assert_eq!(url.host_str(), Some("cdn.example.com"));
    }

    #[test]
    fn test_image_url_refuses_other_schemes() {
        let remote = HttpRemote::new("https://reader.example.com", None)
            .unwrap()
            .with_private_hosts(true);
        for raw in ["file:///etc/passwd", "data:image/png;base64,AAAA", "not a url"] {
            assert!(
                matches!(remote.image_url(raw), Err(RemoteError::InvalidUrl(_))),
                "{raw} should be refused"
            );
        }
    }

    #[test]
    fn test_image_url_refuses_internal_hosts() {
        let remote = HttpRemote::new("https://reader.example.com", None).unwrap();
        for raw in [
            "http://localhost/x.png",
            "http://127.0.0.1:8080/x.png",
            "http://10.0.0.5/x.png",
            "http://169.254.169.254/latest",
            "http://[::1]/x.png",
            "http://[fd00::1]/x.png",
            "http://[::ffff:192.168.1.1]/x.png",
        ] {
            assert!(
                matches!(remote.image_url(raw), Err(RemoteError::InvalidUrl(_))),
                "{raw} should be refused"
            );
        }

        let permissive = remote.with_private_hosts(true);
        assert!(permissive.image_url("http://127.0.0.1:8080/x.png").is_ok());
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let remote = HttpRemote::new("https://reader.example.com/api", None).unwrap();
        assert_eq!(
            remote.endpoint("reader/feeds").unwrap().as_str(),
            "https://reader.example.com/api/reader/feeds"
        );
    }

    #[test]
    fn test_rejects_non_http_base() {
        assert!(matches!(
            HttpRemote::new("ftp://reader.example.com", None),
            Err(RemoteError::InvalidUrl(_))
        ));
    }
}
