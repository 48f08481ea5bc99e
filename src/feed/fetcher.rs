use crate::feed::item::Item;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::redirect::Policy;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// Statuses treated as "server briefly unavailable" and retried.
pub const TRANSIENT_STATUSES: [u16; 3] = [502, 503, 504];

/// Errors surfaced by [`HttpFetcher`].
///
/// `Timeout`, `Connect` and `Transient` are retried internally; callers only
/// see them once the retry budget is exhausted. Everything else is returned
/// on the first occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Request (send + body) exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Connection could not be established or broke mid-body
    #[error("Connection failed: {0}")]
    Connect(String),
    /// 502/503/504 after exhausting retries
    #[error("Server temporarily unavailable: status {0}")]
    Transient(u16),
    /// Any other 5xx
    #[error("Server error: status {0}")]
    Server(u16),
    /// 429 Too Many Requests
    #[error("Rate limited by server")]
    RateLimited,
    /// Non-retryable 4xx
    #[error("Request rejected: status {0}")]
    Client(u16),
    /// Body could not be decoded, or exceeded the size limit
    #[error("Malformed response: {0}")]
    Malformed(String),
    /// Connectivity is down; no request was sent
    #[error("No network connection")]
    Offline,
    #[error("Request failed: {0}")]
    Unknown(String),
}

impl FetchError {
    /// Returns true if the request should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_) | FetchError::Connect(_) | FetchError::Transient(_)
        )
    }

    /// Non-retryable 4xx, rate limiting included.
    pub fn is_client_error(&self) -> bool {
        matches!(self, FetchError::Client(_) | FetchError::RateLimited)
    }

    /// Errors a UI should not make noise about.
    pub fn is_quiet(&self) -> bool {
        matches!(self, FetchError::Offline | FetchError::RateLimited)
    }

    fn from_status(status: u16) -> Self {
        match status {
            429 => FetchError::RateLimited,
            s if TRANSIENT_STATUSES.contains(&s) => FetchError::Transient(s),
            500..=599 => FetchError::Server(status),
            400..=499 => FetchError::Client(status),
            _ => FetchError::Unknown(format!("unexpected status {}", status)),
        }
    }

    fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(timeout)
        } else if err.is_connect() || err.is_body() {
            FetchError::Connect(err.to_string())
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Unknown(err.to_string())
        }
    }
}

/// Shared online/offline flag.
///
/// Cloned into every component that must short-circuit while offline; the
/// coordinator is the only writer.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sets the flag, returning the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.0.swap(online, Ordering::AcqRel)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Timeout and retry budget applied to every request.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Retry `n` waits `backoff * n`.
    pub backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(12),
            max_retries: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

/// API paths, relative to the base URL.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub listing_path: String,
    pub item_path: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            listing_path: "/v1/feed".to_string(),
            item_path: "/v1/items".to_string(),
        }
    }
}

/// One page of the feed listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedPage {
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default, alias = "nextCursor")]
    next_cursor: Option<String>,
}

impl FeedPage {
    /// Pagination token for the following page; `None` when absent or empty.
    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref().filter(|c| !c.is_empty())
    }
}

/// Create a custom redirect policy with loop detection and limited hops.
fn create_redirect_policy() -> Policy {
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
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// Builds the shared HTTP client used by the fetcher.
pub fn build_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
        .redirect(create_redirect_policy())
        .connect_timeout(Duration::from_secs(10))
        .build()
}

/// Request/response utility for the feed API.
///
/// Knows nothing about categories or caching. Policy: transient failures get
/// bounded retries with linear backoff, everything else fails fast.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
    endpoints: Endpoints,
    policy: FetchPolicy,
    connectivity: Connectivity,
    api_token: Option<Arc<SecretString>>,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, base_url: Url, connectivity: Connectivity) -> Self {
        Self {
            client,
            base_url,
            endpoints: Endpoints::default(),
            policy: FetchPolicy::default(),
            connectivity,
            api_token: None,
        }
    }

    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_api_token(mut self, token: Option<SecretString>) -> Self {
        self.api_token = token.map(Arc::new);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Fetches `path` (relative to the base URL) with the given query pairs.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Offline`] - connectivity is down, nothing was sent
    /// - [`FetchError::Timeout`] / [`FetchError::Connect`] / [`FetchError::Transient`] -
    ///   still failing after `1 + max_retries` attempts
    /// - [`FetchError::RateLimited`] / [`FetchError::Client`] / [`FetchError::Server`] -
    ///   first occurrence, no retry
    /// - [`FetchError::Malformed`] - body exceeded the size limit
    pub async fn fetch(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<u8>, FetchError> {
        let mut url = self.endpoint(path, None)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        self.fetch_url(&url).await
    }

    /// Fetches one page of the listing for `category`.
    ///
    /// `since` asks for items strictly newer than that instant; `cursor` is
    /// the opaque token from a previous page.
    pub async fn list_items(
        &self,
        category: &str,
        limit: u32,
        since: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<FeedPage, FetchError> {
        let mut query = vec![("category", category.to_string()), ("limit", limit.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let body = self.fetch(&self.endpoints.listing_path, &query).await?;
        decode_json(&body)
    }

    /// Looks up a single item by id. The id is percent-encoded as one path
    /// segment.
    pub async fn get_item(&self, id: &str) -> Result<Item, FetchError> {
        let url = self.endpoint(&self.endpoints.item_path, Some(id))?;
        let body = self.fetch_url(&url).await?;
        decode_json(&body)
    }

    fn endpoint(&self, path: &str, trailing_segment: Option<&str>) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| FetchError::Unknown(format!("Invalid base URL: {}", self.base_url)))?;
            segments
                .pop_if_empty()
                .extend(path.split('/').filter(|s| !s.is_empty()));
            if let Some(segment) = trailing_segment {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    async fn fetch_url(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let mut retry_count: u32 = 0;

        loop {
            if !self.connectivity.is_online() {
                return Err(FetchError::Offline);
            }

            match self.send_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && retry_count < self.policy.max_retries => {
                    retry_count += 1;
                    let delay = self.policy.backoff * retry_count;
                    tracing::warn!(
                        url = %url,
                        error = %e,
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, attempts = retry_count + 1, "Request failed");
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let timeout = self.policy.timeout;
        let request = async {
            let mut request = self
                .client
                .get(url.clone())
                .header(ACCEPT, "application/json");
            if let Some(token) = &self.api_token {
                request = request.bearer_auth(token.expose_secret());
            }

            let response = request
                .send()
                .await
                .map_err(|e| FetchError::from_transport(e, timeout))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::from_status(status.as_u16()));
            }

            read_limited_bytes(response, MAX_RESPONSE_SIZE, timeout).await
        };

        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
    }
}

fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, FetchError> {
    serde_json::from_slice(body).map_err(|e| FetchError::Malformed(e.to_string()))
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
    timeout: Duration,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::Malformed(format!(
                "response exceeds {} bytes",
                limit
            )));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::from_transport(e, timeout))?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::Malformed(format!(
                "response exceeds {} bytes",
                limit
            )));
        }
        bytes.extend_from_slice(&chunk);
    }

    // Fewer bytes than Content-Length: the connection dropped mid-body
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::Connect(format!(
                "incomplete response: expected {} bytes, received {}",
                expected,
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use wiremock::matchers::{any, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"{"items":[{"id":"a","title":"A","publishedAt":"2024-01-01T00:00:00Z"}]}"#;

    fn fetcher_for(server: &MockServer) -> HttpFetcher {
        HttpFetcher::new(
            reqwest::Client::new(),
            Url::parse(&server.uri()).unwrap(),
            Connectivity::new(true),
        )
        .with_policy(FetchPolicy {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            backoff: Duration::from_millis(20),
        })
    }

    #[tokio::test]
    async fn test_list_items_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/feed"))
            .and(query_param("category", "all"))
            .and(query_param("limit", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&mock_server)
            .await;

        let page = fetcher_for(&mock_server)
            .list_items("all", 50, None, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "a");
        assert!(page.next_cursor().is_none());
    }

    #[tokio::test]
    async fn test_list_items_sends_since_and_cursor() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("since", "2024-01-02T00:00:00Z"))
            .and(query_param("cursor", "page-2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"items":[],"next_cursor":""}"#),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let since = crate::feed::item::parse_timestamp("2024-01-02T00:00:00Z");
        let page = fetcher_for(&mock_server)
            .list_items("all", 10, since, Some("page-2"))
            .await
            .unwrap();
        assert!(page.items.is_empty());
        // Empty cursor means no further pages
        assert!(page.next_cursor().is_none());
    }

    #[tokio::test]
    async fn test_404_fails_fast_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = fetcher_for(&mock_server)
            .list_items("all", 10, None, None)
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Client(404));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_request_failure_after_connect_is_not_retried() {
        use std::sync::atomic::AtomicUsize;

        // Accepts the connection, then hangs up without answering
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });

        let fetcher = HttpFetcher::new(
            reqwest::Client::new(),
            Url::parse(&format!("http://{addr}/")).unwrap(),
            Connectivity::new(true),
        )
        .with_policy(FetchPolicy {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            backoff: Duration::from_millis(20),
        });

        let err = fetcher.list_items("all", 10, None, None).await.unwrap_err();
        assert!(!err.is_retryable(), "{err:?}");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_429_is_rate_limited_and_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = fetcher_for(&mock_server)
            .fetch("/v1/feed", &[])
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::RateLimited);
        assert!(err.is_quiet());
    }

    #[tokio::test]
    async fn test_500_is_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = fetcher_for(&mock_server)
            .fetch("/v1/feed", &[])
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Server(500));
    }

    #[tokio::test]
    async fn test_503_exhausts_retry_budget_with_linear_backoff() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .expect(3) // Initial request + 2 retries
            .mount(&mock_server)
            .await;

        let started = Instant::now();
        let err = fetcher_for(&mock_server)
            .fetch("/v1/feed", &[])
            .await
            .unwrap_err();
        assert_eq!(err, FetchError::Transient(503));
        // 20ms * 1 + 20ms * 2
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_502_retry_then_success() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .mount(&mock_server)
            .await;

        let page = fetcher_for(&mock_server)
            .list_items("all", 10, None, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retried_then_surfaced() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(PAGE)
                    .set_delay(Duration::from_millis(500)),
            )
            .expect(2)
            .mount(&mock_server)
            .await;

        let fetcher = fetcher_for(&mock_server).with_policy(FetchPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 1,
            backoff: Duration::from_millis(10),
        });
        let err = fetcher.fetch("/v1/feed", &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&mock_server)
            .await;

        let err = fetcher_for(&mock_server)
            .list_items("all", 10, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_offline_short_circuits() {
        let mock_server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(0)
            .mount(&mock_server)
            .await;

        let fetcher = fetcher_for(&mock_server);
        fetcher.connectivity().set_online(false);
        let err = fetcher.list_items("all", 10, None, None).await.unwrap_err();
        assert_eq!(err, FetchError::Offline);
    }

    #[tokio::test]
    async fn test_get_item_percent_encodes_id() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/items/a%20b%2Fc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"id":"a b/c","title":"Odd"}"#),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let item = fetcher_for(&mock_server).get_item("a b/c").await.unwrap();
        assert_eq!(item.id, "a b/c");
        assert_eq!(item.title, "Odd");
    }

    #[tokio::test]
    async fn test_bearer_token_sent_when_configured() {
        use wiremock::matchers::header;

        let mock_server = MockServer::start().await;
        Mock::given(header("Authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&mock_server)
            .await;

        let fetcher = fetcher_for(&mock_server).with_api_token(Some(SecretString::from("secret-token")));
        assert!(fetcher.list_items("all", 10, None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_base_url_path_prefix_is_kept() {
        let mock_server = MockServer::start().await;
        Mock::given(path("/api/v1/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE))
            .expect(1)
            .mount(&mock_server)
            .await;

        let fetcher = HttpFetcher::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/api/", mock_server.uri())).unwrap(),
            Connectivity::new(true),
        );
        assert!(fetcher.list_items("all", 10, None, None).await.is_ok());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(FetchError::from_status(503), FetchError::Transient(503));
        assert_eq!(FetchError::from_status(504), FetchError::Transient(504));
        assert_eq!(FetchError::from_status(501), FetchError::Server(501));
        assert_eq!(FetchError::from_status(400), FetchError::Client(400));
        assert_eq!(FetchError::from_status(429), FetchError::RateLimited);
        assert!(FetchError::Transient(502).is_retryable());
        assert!(!FetchError::Server(500).is_retryable());
        assert!(!FetchError::Offline.is_retryable());
    }
}
