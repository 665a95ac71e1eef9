//! Document Fetcher: retrieves raw feed XML over HTTP.
//!
//! One GET per call, bounded end to end by a single timeout that covers
//! connecting, headers and the body read. There is no retry and no caching
//! here; both belong to the orchestrator's policy.

use std::time::Duration;

use futures::StreamExt;
use reqwest::redirect::Policy;
use thiserror::Error;
use url::Url;

use super::xml::decode_bytes;
use crate::util::validate_feed_url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
pub const DEFAULT_USER_AGENT: &str = concat!("tunefeed/", env!("CARGO_PKG_VERSION"));

const MAX_REDIRECTS: usize = 5;
const ACCEPT: &str =
    "application/rss+xml, application/xml;q=0.9, text/xml;q=0.9, */*;q=0.5";

/// Why a fetch failed.
#[derive(Debug, Error)]
pub enum FetchCause {
    /// DNS, connection, TLS, redirect or body-stream failure.
    #[error("request failed: {0}")]
    Network(#[source] reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
    /// Fewer bytes arrived than `Content-Length` announced.
    #[error("incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// A failed fetch, carrying the URL it was for.
#[derive(Debug, Error)]
#[error("Failed to fetch {url}: {cause}")]
pub struct FetchError {
    pub url: String,
    #[source]
    pub cause: FetchCause,
}

impl FetchError {
    fn new(url: &str, cause: FetchCause) -> Self {
        Self {
            url: url.to_string(),
            cause,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, FetchCause::Timeout(_))
    }

    /// HTTP status code, if the server answered with a non-success status.
    pub fn status(&self) -> Option<u16> {
        match self.cause {
            FetchCause::HttpStatus(code) => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub max_size: usize,
    pub user_agent: String,
    /// Permit loopback and private-network hosts, redirect targets included.
    pub allow_private_hosts: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_size: DEFAULT_MAX_FEED_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            allow_private_hosts: false,
        }
    }
}

/// Follows at most [`MAX_REDIRECTS`] hops, refuses loops and, unless
/// `allow_private` is set, refuses hops into private or loopback hosts.
fn redirect_policy(allow_private: bool) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        if attempt
            .previous()
            .iter()
            .any(|prev| prev.as_str() == attempt.url().as_str())
        {
            return attempt.error("redirect loop detected");
        }
        if let Err(e) = validate_feed_url(attempt.url().as_str(), allow_private) {
            tracing::warn!(to = %attempt.url(), error = %e, "Refusing redirect");
            return attempt.error(format!("redirect refused: {e}"));
        }
        tracing::debug!(to = %attempt.url(), hop = attempt.previous().len() + 1, "Following redirect");
        attempt.follow()
    })
}

/// HTTP client for feed documents. Cheap to clone; clones share the
/// connection pool.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    config: FetcherConfig,
}

impl Fetcher {
    /// Builds a fetcher with its own connection pool.
    ///
    /// # Errors
    ///
    /// Fails only if the TLS backend cannot be initialized.
    pub fn new(config: FetcherConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirect_policy(config.allow_private_hosts))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Fetches `url` and returns the decoded document text.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] for an unparseable or non-http(s) URL, a
    /// private or loopback host when those are not allowed, a
    /// transport failure, a non-2xx status, an oversized or truncated body,
    /// or when the whole exchange exceeds the configured timeout.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let parsed = validate_feed_url(url, self.config.allow_private_hosts)
            .map_err(|e| FetchError::new(url, FetchCause::InvalidUrl(e.to_string())))?;

        let started = std::time::Instant::now();
        let bytes = tokio::time::timeout(self.config.timeout, self.fetch_bytes(parsed))
            .await
            .map_err(|_| FetchError::new(url, FetchCause::Timeout(self.config.timeout)))?
            .map_err(|cause| FetchError::new(url, cause))?;

        tracing::debug!(
            url = %url,
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched feed document"
        );
        Ok(decode_bytes(&bytes))
    }

    async fn fetch_bytes(&self, url: Url) -> Result<Vec<u8>, FetchCause> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchCause::HttpStatus(status.as_u16()));
        }

        read_limited_bytes(response, self.config.max_size)
            .await
            .map_err(|cause| match cause {
                FetchCause::Network(e) => self.classify(e),
                other => other,
            })
    }

    fn classify(&self, e: reqwest::Error) -> FetchCause {
        if e.is_timeout() {
            FetchCause::Timeout(self.config.timeout)
        } else {
            FetchCause::Network(e)
        }
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchCause> {
    let expected_length = response.content_length();
    if expected_length.is_some_and(|len| len > limit as u64) {
        return Err(FetchCause::ResponseTooLarge { limit });
    }

    let mut bytes = Vec::with_capacity(expected_length.map_or(0, |len| len as usize));
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchCause::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchCause::ResponseTooLarge { limit });
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchCause::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Test</title></channel></rss>"#;

    // The mock server listens on loopback.
    fn local_fetcher() -> Fetcher {
        fetcher_with(DEFAULT_TIMEOUT, DEFAULT_MAX_FEED_SIZE)
    }

    fn fetcher_with(timeout: Duration, max_size: usize) -> Fetcher {
        Fetcher::new(FetcherConfig {
            timeout,
            max_size,
            allow_private_hosts: true,
            ..FetcherConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("Content-Type", "application/rss+xml"),
            )
            .mount(&server)
            .await;

        let body = local_fetcher()
            .fetch(&format!("{}/feed.xml", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, VALID_RSS);
    }

    #[tokio::test]
    async fn test_fetch_sends_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", DEFAULT_USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = local_fetcher();
        assert!(fetcher.fetch(&server.uri()).await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_404_is_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let url = format!("{}/missing.xml", server.uri());
        let err = local_fetcher()
            .fetch(&url)
            .await
            .unwrap_err();
        assert_eq!(err.url, url);
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_fetch_500_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let err = local_fetcher()
            .fetch(&server.uri())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = fetcher_with(Duration::from_millis(200), DEFAULT_MAX_FEED_SIZE)
            .fetch(&server.uri())
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
    }

    #[tokio::test]
    async fn test_fetch_response_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(4096)))
            .mount(&server)
            .await;

        let err = fetcher_with(DEFAULT_TIMEOUT, 1024)
            .fetch(&server.uri())
            .await
            .unwrap_err();
        assert!(matches!(
            err.cause,
            FetchCause::ResponseTooLarge { limit: 1024 }
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_http_url() {
        let fetcher = Fetcher::new(FetcherConfig::default()).unwrap();
        let err = fetcher.fetch("ftp://example.com/feed.xml").await.unwrap_err();
        assert!(matches!(err.cause, FetchCause::InvalidUrl(_)));
        let err = fetcher.fetch("not a url").await.unwrap_err();
        assert!(matches!(err.cause, FetchCause::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_fetch_refuses_private_hosts_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(0)
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(FetcherConfig::default()).unwrap();
        let err = fetcher.fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err.cause, FetchCause::InvalidUrl(_)), "got {err:?}");
        let err = fetcher.fetch("http://10.1.2.3/feed.xml").await.unwrap_err();
        assert!(matches!(err.cause, FetchCause::InvalidUrl(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_redirect_into_private_host_refused() {
        let target = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .expect(0)
            .mount(&target)
            .await;

        // A bare client with the policy, so the loopback origin itself is
        // reachable and only the redirect hop is judged.
        let client = reqwest::Client::builder()
            .redirect(redirect_policy(false))
            .build()
            .unwrap();
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/feed.xml", target.uri()).as_str()),
            )
            .mount(&origin)
            .await;

        let err = client.get(origin.uri()).send().await.unwrap_err();
        assert!(err.is_redirect(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_network() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = local_fetcher()
            .fetch(&format!("http://127.0.0.1:{port}/feed.xml"))
            .await
            .unwrap_err();
        assert!(matches!(err.cause, FetchCause::Network(_)));
    }

    #[tokio::test]
    async fn test_fetch_decodes_latin1() {
        let server = MockServer::start().await;
        let body: Vec<u8> =
            b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><rss><channel><title>Caf\xe9</title></channel></rss>"
                .to_vec();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let text = local_fetcher()
            .fetch(&server.uri())
            .await
            .unwrap();
        assert!(text.contains("Café"));
    }
}
