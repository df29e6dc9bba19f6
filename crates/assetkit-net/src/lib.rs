//! # AssetKit Net
//!
//! Request/response types and network fetching for the AssetKit cache worker.
//!
//! ## Design Goals
//!
//! 1. **Host-independent requests**: method, URL, headers and request mode, without a browser
//! 2. **Single-use bodies**: a response body can be read once; copies go through [`Response::try_clone`]
//! 3. **Pluggable network**: the worker only sees the [`Fetcher`] trait
//! 4. **Real HTTP**: [`ResourceLoader`] implements [`Fetcher`] on top of `reqwest`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;

pub use url::Url;

pub mod loader;

pub use loader::{LoaderConfig, ResourceLoader};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Response body already used")]
    BodyUsed,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the request was issued by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    /// Same-origin subresource.
    SameOrigin,
    /// Opaque cross-origin subresource.
    NoCors,
    /// Script-initiated fetch.
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Create a page navigation request.
    pub fn navigate(url: Url) -> Self {
        Self::get(url).mode(RequestMode::Navigate)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Parse a URL and build a request with the given method.
    pub fn parse(method: &str, url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;
        Ok(Self {
            method,
            ..Self::get(url)
        })
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this request loads a full page document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response with a body that can be consumed once.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Set when the response was served from a cache bucket.
    pub from_cache: bool,
    body: Option<Bytes>,
}

impl Response {
    /// Create a response with a full body.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            from_cache: false,
            body: Some(body.into()),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the body has already been taken.
    pub fn body_used(&self) -> bool {
        self.body.is_none()
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Copy the response, body included. Fails once the body is used.
    pub fn try_clone(&self) -> Result<Response, NetError> {
        let body = self.body.clone().ok_or(NetError::BodyUsed)?;
        Ok(Response {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            from_cache: self.from_cache,
            body: Some(body),
        })
    }

    /// Take the body, leaving the response marked as used.
    pub fn take_body(&mut self) -> Result<Bytes, NetError> {
        self.body.take().ok_or(NetError::BodyUsed)
    }

    /// Get the body as bytes.
    pub async fn bytes(mut self) -> Result<Bytes, NetError> {
        self.take_body()
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// The network, as seen by the cache worker.
pub trait Fetcher: Send + Sync {
    /// Perform the request.
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}

impl<F: Fetcher + ?Sized> Fetcher for Arc<F> {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        (**self).fetch(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = Request::get(url("https://example.com"))
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("text/html"),
            )
            .timeout(Duration::from_secs(10));

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.mode, RequestMode::Cors);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigate_request() {
        let request = Request::navigate(url("https://example.com/about"));
        assert!(request.is_navigation());
        assert_eq!(request.method, Method::GET);
    }

    #[test]
    fn test_parse_request() {
        let request = Request::parse("post", "https://example.com/api/items").unwrap();
        assert_eq!(request.method, Method::POST);
        assert!(matches!(
            Request::parse("GET", "not a url"),
            Err(NetError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[tokio::test]
    async fn test_body_is_single_use() {
        let mut response = Response::new(url("https://example.com/"), StatusCode::OK, "hello");
        let copy = response.try_clone().unwrap();

        assert_eq!(response.take_body().unwrap(), Bytes::from("hello"));
        assert!(response.body_used());
        assert!(matches!(response.try_clone(), Err(NetError::BodyUsed)));

        assert_eq!(copy.text().await.unwrap(), "hello");
    }

    #[test]
    fn test_content_type() {
        let response = Response::new(url("https://example.com/app.css"), StatusCode::OK, "")
            .with_header(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/css; charset=utf-8"),
            );
        assert_eq!(response.content_type().unwrap().subtype(), mime::CSS);
    }
}
