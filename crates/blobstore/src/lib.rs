use async_trait::async_trait;

mod http;
mod memory;

pub use self::http::{HttpBlobStore, HttpBlobStoreConfig};
pub use self::memory::MemoryBlobStore;

#[derive(Debug)]
pub enum BlobStoreError {
    NotFound(String),
    Timeout,
    Unavailable(String),
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
    InvalidUrl(String),
}

impl std::fmt::Display for BlobStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobStoreError::NotFound(blob_id) => write!(f, "blob {} not found", blob_id),
            BlobStoreError::Timeout => write!(f, "blob store request timed out"),
            BlobStoreError::Unavailable(reason) => write!(f, "blob store unavailable: {}", reason),
            BlobStoreError::Http(err) => write!(f, "blob store HTTP error: {}", err),
            BlobStoreError::BadStatus(status) => write!(f, "blob store returned status {}", status),
            BlobStoreError::InvalidResponse => write!(f, "blob store returned an invalid response"),
            BlobStoreError::InvalidUrl(reason) => write!(f, "invalid blob store URL: {}", reason),
        }
    }
}

impl std::error::Error for BlobStoreError {}

impl From<reqwest::Error> for BlobStoreError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            BlobStoreError::Timeout
        } else {
            BlobStoreError::Http(value)
        }
    }
}

/// Result of an upload. `end_epoch` is reported by stores that track leases
/// in storage epochs; it is informational for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobReceipt {
    pub blob_id: String,
    pub end_epoch: Option<u64>,
}

/// Content-addressed, immutable object storage. Every `put` yields a fresh
/// lease; content is never mutated in place.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>, lease_epochs: u32) -> Result<BlobReceipt, BlobStoreError>;

    async fn get(&self, blob_id: &str) -> Result<Vec<u8>, BlobStoreError>;

    async fn head(&self, blob_id: &str) -> Result<bool, BlobStoreError>;
}
