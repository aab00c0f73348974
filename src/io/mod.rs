mod http;
mod local;

pub use http::HttpTransport;
pub use local::LocalFile;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// Headers describing a remote resource, as returned by a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceHead {
    /// Total length of the resource in bytes
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Random access to a byte-addressed document.
///
/// This is the shape the navigator reads through: a total size and an
/// inclusive range fetch. Ranges extending past the end are clamped.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Total size of the document in bytes
    async fn size(&self) -> Result<u64>;

    /// Fetch bytes `start..=end`
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>>;
}

/// A single-URL transport used by the mirror racer.
///
/// Every call carries its own deadline; a transport must give up once it
/// has elapsed.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn head(&self, url: &str, timeout: Duration) -> Result<ResourceHead>;

    /// GET `url`, optionally restricted to the inclusive byte range `range`
    async fn get(&self, url: &str, range: Option<(u64, u64)>, timeout: Duration) -> Result<Vec<u8>>;
}

/// Resource-addressed upstream that the sparse cache fills itself from.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn head(&self, resource_id: &str) -> Result<ResourceHead>;

    /// Fetch the inclusive range `start..=end` of a resource (HTTP Range semantics)
    async fn get_range(&self, resource_id: &str, start: u64, end: u64) -> Result<Vec<u8>>;
}
