//! Cache storage: named buckets of request/response pairs.

use std::fmt;
use std::sync::Arc;

use assetkit_net::{Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::WorkerError;

// ==================== Keys ====================

/// Request identity inside a bucket: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.to_ascii_uppercase(),
            url: url.into(),
        }
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.as_str(), &request.url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers. Values that are not valid UTF-8 are dropped.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response, consuming its body.
    pub fn from_response(key: &RequestKey, mut response: Response) -> Result<Self, WorkerError> {
        let body = response.take_body()?;
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status.as_u16(),
            headers,
            body: body.to_vec(),
            cached_at: now_millis(),
        })
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Result<Response, WorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| WorkerError::CacheError(format!("corrupt entry url {:?}: {e}", self.url)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| WorkerError::CacheError(format!("corrupt entry status: {e}")))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(n, v);
            }
        }

        let mut response = Response::new(url, status, self.body.clone());
        response.headers = headers;
        response.from_cache = true;
        Ok(response)
    }
}

// ==================== Cache ====================

/// A cache bucket.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<RequestKey, CacheEntry>,

    /// Maximum number of entries, if bounded.
    quota: Option<usize>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str, quota: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
            quota,
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace entries, all or none.
    pub fn put_all(&mut self, entries: Vec<CacheEntry>) -> Result<(), WorkerError> {
        if let Some(limit) = self.quota {
            let mut keys: Vec<RequestKey> = entries.iter().map(CacheEntry::key).collect();
            keys.sort();
            keys.dedup();
            let added = keys
                .iter()
                .filter(|key| !self.entries.contains_key(*key))
                .count();
            if self.entries.len() + added > limit {
                return Err(WorkerError::QuotaExceeded {
                    cache: self.name.clone(),
                    limit,
                });
            }
        }

        for entry in entries {
            self.entries.insert(entry.key(), entry);
        }
        Ok(())
    }

    /// Insert or replace an entry.
    pub fn put(&mut self, entry: CacheEntry) -> Result<(), WorkerError> {
        self.put_all(vec![entry])
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<RequestKey> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Serializable copy of every bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub buckets: Vec<BucketSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub name: String,
    pub entries: Vec<CacheEntry>,
}

/// Shared handle to all cache buckets.
///
/// Clones share the same buckets. Each method takes the lock once, so every operation is
/// atomic with respect to the others.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    caches: Arc<RwLock<HashMap<String, Cache>>>,
    quota: Option<usize>,
}

impl CacheStorage {
    /// Create new, unbounded cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage whose buckets hold at most `max_entries` entries each.
    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            caches: Arc::default(),
            quota: Some(max_entries),
        }
    }

    /// Open a cache, creating it if it doesn't exist.
    pub async fn open(&self, name: &str) {
        let quota = self.quota;
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name, quota));
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    /// All cache names, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Look a request up in one cache.
    pub async fn match_in(&self, name: &str, key: &RequestKey) -> Option<CacheEntry> {
        self.caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned()
    }

    /// Store one entry, opening the cache first.
    pub async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), WorkerError> {
        self.put_all(name, vec![entry]).await
    }

    /// Store several entries atomically, opening the cache first.
    pub async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), WorkerError> {
        let quota = self.quota;
        self.caches
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name, quota))
            .put_all(entries)
    }

    /// Number of entries in a cache (0 if missing).
    pub async fn entry_count(&self, name: &str) -> usize {
        self.caches.read().await.get(name).map_or(0, Cache::len)
    }

    /// Keys stored in a cache.
    pub async fn keys_in(&self, name: &str) -> Vec<RequestKey> {
        self.caches
            .read()
            .await
            .get(name)
            .map(Cache::keys)
            .unwrap_or_default()
    }

    /// Copy all buckets out.
    pub async fn snapshot(&self) -> StorageSnapshot {
        let caches = self.caches.read().await;
        let mut buckets: Vec<BucketSnapshot> = caches
            .values()
            .map(|cache| BucketSnapshot {
                name: cache.name.clone(),
                entries: cache
                    .keys()
                    .iter()
                    .filter_map(|key| cache.match_request(key).cloned())
                    .collect(),
            })
            .collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        StorageSnapshot { buckets }
    }

    /// Replace all buckets with a snapshot.
    pub async fn restore(&self, snapshot: StorageSnapshot) -> Result<(), WorkerError> {
        let mut restored = HashMap::new();
        for bucket in snapshot.buckets {
            let mut cache = Cache::new(&bucket.name, self.quota);
            cache.put_all(bucket.entries)?;
            restored.insert(bucket.name, cache);
        }
        *self.caches.write().await = restored;
        Ok(())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: &str) -> CacheEntry {
        let url = Url::parse(url).unwrap();
        let key = RequestKey::new("GET", &url);
        let response = Response::new(url, StatusCode::OK, body.to_string()).with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        CacheEntry::from_response(&key, response).unwrap()
    }

    #[test]
    fn test_request_key_ignores_fragment() {
        let a = RequestKey::new("get", &Url::parse("https://example.com/#top").unwrap());
        let b = RequestKey::new("GET", &Url::parse("https://example.com/").unwrap());
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://example.com/");
    }

    #[test]
    fn test_request_key_distinguishes_method() {
        let url = Url::parse("https://example.com/").unwrap();
        assert_ne!(RequestKey::new("GET", &url), RequestKey::new("HEAD", &url));
    }

    #[tokio::test]
    async fn test_entry_round_trips_to_response() {
        let entry = entry("https://example.com/app.js", "let a = 1;");
        let response = entry.to_response().unwrap();

        assert!(response.from_cache);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(response.text().await.unwrap(), "let a = 1;");
    }

    #[test]
    fn test_corrupt_entry_url() {
        let mut entry = entry("https://example.com/", "x");
        entry.url = "::not a url".to_string();
        assert!(matches!(entry.to_response(), Err(WorkerError::CacheError(_))));
    }

    #[test]
    fn test_cache_put_and_delete() {
        let mut cache = Cache::new("v1", None);
        let e = entry("https://example.com/style.css", "body{}");
        let key = e.key();

        cache.put(e).unwrap();
        assert!(cache.match_request(&key).is_some());

        assert!(cache.delete(&key));
        assert!(cache.match_request(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_quota_is_all_or_nothing() {
        let mut cache = Cache::new("v1", Some(2));
        let result = cache.put_all(vec![
            entry("https://example.com/a", "a"),
            entry("https://example.com/b", "b"),
            entry("https://example.com/c", "c"),
        ]);

        assert!(matches!(result, Err(WorkerError::QuotaExceeded { limit: 2, .. })));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_quota_allows_replacement() {
        let mut cache = Cache::new("v1", Some(1));
        cache.put(entry("https://example.com/a", "old")).unwrap();
        cache.put(entry("https://example.com/a", "new")).unwrap();

        let key = RequestKey::new("GET", &Url::parse("https://example.com/a").unwrap());
        assert_eq!(cache.match_request(&key).unwrap().body, b"new");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_storage_open_has_delete() {
        let storage = CacheStorage::new();

        assert!(!storage.has("v1").await);
        storage.open("v1").await;
        assert!(storage.has("v1").await);

        assert!(storage.delete("v1").await);
        assert!(!storage.delete("v1").await);
        assert!(storage.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_storage_match_is_scoped_to_bucket() {
        let storage = CacheStorage::new();
        let e = entry("https://example.com/", "home");
        let key = e.key();
        storage.put("v0", e).await.unwrap();

        assert!(storage.match_in("v0", &key).await.is_some());
        assert!(storage.match_in("v1", &key).await.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let storage = CacheStorage::new();
        storage
            .put_all(
                "v1",
                vec![
                    entry("https://example.com/", "home"),
                    entry("https://example.com/app.js", "js"),
                ],
            )
            .await
            .unwrap();
        storage.open("v0").await;

        let snapshot = storage.snapshot().await;
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: StorageSnapshot = serde_json::from_str(&json).unwrap();

        let restored = CacheStorage::new();
        restored.restore(parsed).await.unwrap();

        assert_eq!(restored.keys().await, vec!["v0", "v1"]);
        assert_eq!(restored.entry_count("v1").await, 2);
        assert_eq!(restored.snapshot().await, snapshot);
    }
}
