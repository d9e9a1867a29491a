use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use docvault_contracts::canonical;

use crate::{BlobReceipt, BlobStore, BlobStoreError};

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    unreadable: HashSet<String>,
}

/// In-process blob store. Each upload gets a fresh ID, even for identical
/// bytes, because every upload starts a new lease.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
    sequence: AtomicU64,
    put_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes reads of `blob_id` fail as if the blob had expired.
    pub fn mark_unreadable(&self, blob_id: &str) {
        self.lock_inner().unreadable.insert(blob_id.to_string());
    }

    /// Seeds content under a caller-chosen ID.
    pub fn insert(&self, blob_id: &str, bytes: impl Into<Vec<u8>>) {
        self.lock_inner()
            .blobs
            .insert(blob_id.to_string(), bytes.into());
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.lock_inner().blobs.len()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_online(&self) -> Result<(), BlobStoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Unavailable(
                "memory blob store offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>, lease_epochs: u32) -> Result<BlobReceipt, BlobStoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let digest = canonical::content_digest(&bytes);
        let blob_id = format!("mem-{}-{}", &digest[..16], seq);

        self.lock_inner().blobs.insert(blob_id.clone(), bytes);
        Ok(BlobReceipt {
            blob_id,
            end_epoch: Some(u64::from(lease_epochs)),
        })
    }

    async fn get(&self, blob_id: &str) -> Result<Vec<u8>, BlobStoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let inner = self.lock_inner();
        if inner.unreadable.contains(blob_id) {
            return Err(BlobStoreError::NotFound(blob_id.to_string()));
        }
        inner
            .blobs
            .get(blob_id)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound(blob_id.to_string()))
    }

    async fn head(&self, blob_id: &str) -> Result<bool, BlobStoreError> {
        self.check_online()?;
        let inner = self.lock_inner();
        Ok(inner.blobs.contains_key(blob_id) && !inner.unreadable.contains(blob_id))
    }
}
