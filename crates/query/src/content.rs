use std::sync::Arc;

use async_trait::async_trait;
use docvault_blobstore::{BlobStore, BlobStoreError};
use docvault_contracts::SourceCandidate;
use docvault_contracts::canonical::normalize_source_text;

#[derive(Debug)]
pub enum ContentError {
    Blob(BlobStoreError),
    NotText,
    Empty,
}

impl std::fmt::Display for ContentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentError::Blob(err) => write!(f, "{}", err),
            ContentError::NotText => write!(f, "content is not valid UTF-8 text"),
            ContentError::Empty => write!(f, "content is empty"),
        }
    }
}

impl std::error::Error for ContentError {}

impl From<BlobStoreError> for ContentError {
    fn from(value: BlobStoreError) -> Self {
        ContentError::Blob(value)
    }
}

/// Fetches the full text behind a search candidate. Only ever called for
/// candidates that passed authorization.
#[async_trait]
pub trait ContentLoader: Send + Sync {
    async fn load(&self, candidate: &SourceCandidate) -> Result<String, ContentError>;
}

/// Reads candidate content from the blob store, treating `content_ref` as a
/// blob ID.
pub struct BlobContentLoader {
    blobs: Arc<dyn BlobStore>,
}

impl BlobContentLoader {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }
}

#[async_trait]
impl ContentLoader for BlobContentLoader {
    async fn load(&self, candidate: &SourceCandidate) -> Result<String, ContentError> {
        let bytes = self.blobs.get(&candidate.content_ref).await?;
        let text = String::from_utf8(bytes).map_err(|_| ContentError::NotText)?;
        let text = normalize_source_text(&text);
        if text.trim().is_empty() {
            return Err(ContentError::Empty);
        }
        Ok(text)
    }
}
