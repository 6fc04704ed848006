//! Transports fetch metadata documents and raw chunk bytes for a store.

use crate::prelude::{HashMap, HashSet, Mutex};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::PoisonError;
use std::time::Duration;

/// Byte range of a partial read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteRange {
    /// `length` bytes starting at `offset`
    Span { offset: u64, length: u64 },
    /// The last `n` bytes of the object
    Suffix(u64),
}

impl ByteRange {
    /// Resolves the range against an object of `len` bytes
    pub fn slice(self, len: usize) -> Option<std::ops::Range<usize>> {
        match self {
            ByteRange::Span { offset, length } => {
                let start = usize::try_from(offset).ok()?;
                let end = start.checked_add(usize::try_from(length).ok()?)?;
                (end <= len).then_some(start..end)
            }
            ByteRange::Suffix(n) => {
                let n = usize::try_from(n).ok()?;
                (n <= len).then(|| len - n..len)
            }
        }
    }

    /// Value of an HTTP `Range` header
    pub fn header_value(self) -> String {
        match self {
            ByteRange::Span { offset, length } => {
                format!("bytes={}-{}", offset, offset + length.saturating_sub(1))
            }
            ByteRange::Suffix(n) => format!("bytes=-{}", n),
        }
    }
}

/// Network (or storage) access used by a pyramid store.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch and parse a JSON metadata document. Failures are metadata errors.
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value>;

    /// Fetch raw bytes. `Ok(None)` means the object does not exist, which for
    /// chunks means "all fill value".
    async fn fetch_bytes(&self, url: &str, range: Option<ByteRange>) -> Result<Option<Vec<u8>>>;
}

/// Joins a store root and a relative key
pub fn join_url(source: &str, key: &str) -> String {
    format!("{}/{}", source.trim_end_matches('/'), key.trim_start_matches('/'))
}

#[cfg(feature = "http")]
mod http {
    use super::*;
    use once_cell::sync::Lazy;

    /// Shared async HTTP client for metadata and chunk requests
    pub(crate) static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
        reqwest::Client::builder()
            .user_agent("gridlet/0.1.0")
            .timeout(std::time::Duration::from_secs(30))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .pool_max_idle_per_host(16)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    });

    /// Transport over HTTP(S) using the shared reqwest client
    #[derive(Debug, Clone, Default)]
    pub struct HttpTransport;

    impl HttpTransport {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
            log::debug!("fetching metadata {}", url);
            let response = HTTP_CLIENT
                .get(url)
                .send()
                .await
                .map_err(|e| Error::Metadata(format!("{}: {}", url, e)))?;

            if !response.status().is_success() {
                return Err(Error::Metadata(format!(
                    "HTTP {} for metadata {}",
                    response.status(),
                    url
                )));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| Error::Metadata(format!("{}: {}", url, e)))
        }

        async fn fetch_bytes(
            &self,
            url: &str,
            range: Option<ByteRange>,
        ) -> Result<Option<Vec<u8>>> {
            let fetch_error = |reason: String| Error::ChunkFetch {
                url: url.to_string(),
                reason,
            };

            let mut request = HTTP_CLIENT.get(url);
            if let Some(range) = range {
                request = request.header(reqwest::header::RANGE, range.header_value());
            }
            let response = request.send().await.map_err(|e| fetch_error(e.to_string()))?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(fetch_error(format!("HTTP {}", status)));
            }

            let bytes = response.bytes().await.map_err(|e| fetch_error(e.to_string()))?;
            Ok(Some(bytes.to_vec()))
        }
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

/// In-memory object store keyed by URL.
///
/// Records how often each URL is requested and can be told to fail specific
/// URLs or delay every response, which makes it suitable both for tests and
/// for serving pyramids generated in-process.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    requests: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every response, so concurrent requests overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        lock(&self.objects).insert(url.into(), bytes);
    }

    pub fn insert_json(&self, url: impl Into<String>, value: &serde_json::Value) {
        self.insert(url, value.to_string().into_bytes());
    }

    /// Make every request for `url` fail until [`MemoryTransport::recover`]
    pub fn fail(&self, url: impl Into<String>) {
        lock(&self.failing).insert(url.into());
    }

    pub fn recover(&self, url: &str) {
        lock(&self.failing).remove(url);
    }

    /// Number of requests made for `url`
    pub fn request_count(&self, url: &str) -> usize {
        lock(&self.requests).get(url).copied().unwrap_or(0)
    }

    /// Number of requests made for any URL
    pub fn total_requests(&self) -> usize {
        lock(&self.requests).values().sum()
    }

    async fn record(&self, url: &str) -> std::result::Result<Option<Vec<u8>>, String> {
        *lock(&self.requests).entry(url.to_string()).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.failing).contains(url) {
            return Err(format!("injected failure for {}", url));
        }
        Ok(lock(&self.objects).get(url).cloned())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        match self.record(url).await {
            Ok(Some(bytes)) => Ok(serde_json::from_slice(&bytes)?),
            Ok(None) => Err(Error::Metadata(format!("metadata not found: {}", url))),
            Err(reason) => Err(Error::Metadata(reason)),
        }
    }

    async fn fetch_bytes(&self, url: &str, range: Option<ByteRange>) -> Result<Option<Vec<u8>>> {
        let bytes = match self.record(url).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(reason) => {
                return Err(Error::ChunkFetch {
                    url: url.to_string(),
                    reason,
                })
            }
        };

        match range {
            None => Ok(Some(bytes)),
            Some(range) => match range.slice(bytes.len()) {
                Some(span) => Ok(Some(bytes[span].to_vec())),
                None => Err(Error::ChunkFetch {
                    url: url.to_string(),
                    reason: format!("range {:?} outside object of {} bytes", range, bytes.len()),
                }),
            },
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_slicing() {
        assert_eq!(ByteRange::Suffix(4).slice(10), Some(6..10));
        assert_eq!(ByteRange::Span { offset: 2, length: 3 }.slice(10), Some(2..5));
        assert_eq!(ByteRange::Span { offset: 8, length: 3 }.slice(10), None);
        assert_eq!(ByteRange::Span { offset: 2, length: 3 }.header_value(), "bytes=2-4");
        assert_eq!(ByteRange::Suffix(16).header_value(), "bytes=-16");
    }

    #[tokio::test]
    async fn test_memory_transport_counts_and_fails() {
        let transport = MemoryTransport::new();
        transport.insert("mem://a", vec![1, 2, 3]);

        assert_eq!(transport.fetch_bytes("mem://a", None).await, Ok(Some(vec![1, 2, 3])));
        assert_eq!(transport.fetch_bytes("mem://missing", None).await, Ok(None));

        transport.fail("mem://a");
        assert!(matches!(
            transport.fetch_bytes("mem://a", None).await,
            Err(Error::ChunkFetch { .. })
        ));
        transport.recover("mem://a");

        assert_eq!(transport.request_count("mem://a"), 2);
        assert_eq!(transport.total_requests(), 3);
    }
}
