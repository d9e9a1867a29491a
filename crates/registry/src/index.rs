use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use docvault_blobstore::{BlobStore, BlobStoreError};
use docvault_contracts::{
    IndexDocument, IndexKind, ItemMetadata, ItemUpdate, NamespacedKey, unix_epoch_ms_now,
    validate_principal_id,
};

use crate::{MetadataRegistry, RegistryError, metrics};

pub const DEFAULT_INDEX_LEASE_EPOCHS: u32 = 30;

#[derive(Debug)]
pub enum IndexError {
    InvalidInput(&'static str),
    Registry(RegistryError),
    Blob(BlobStoreError),
    Encode(serde_json::Error),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::InvalidInput(reason) => write!(f, "invalid input: {}", reason),
            IndexError::Registry(err) => write!(f, "registry error: {}", err),
            IndexError::Blob(err) => write!(f, "{}", err),
            IndexError::Encode(err) => write!(f, "index encode error: {}", err),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<RegistryError> for IndexError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::InvalidInput(reason) => IndexError::InvalidInput(reason),
            other => IndexError::Registry(other),
        }
    }
}

impl From<BlobStoreError> for IndexError {
    fn from(value: BlobStoreError) -> Self {
        IndexError::Blob(value)
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(value: serde_json::Error) -> Self {
        IndexError::Encode(value)
    }
}

type LockKey = (String, IndexKind);
type LockMap = Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>;

/// Loads and rewrites per-principal index documents. Each mutation is a
/// load-modify-save serialized per `(principal, kind)` within this process.
pub struct IndexStore {
    registry: Arc<MetadataRegistry>,
    blobs: Arc<dyn BlobStore>,
    lease_epochs: u32,
    locks: LockMap,
}

enum Loaded {
    Found(IndexDocument),
    Absent,
}

impl IndexStore {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        blobs: Arc<dyn BlobStore>,
        lease_epochs: u32,
    ) -> Self {
        Self {
            registry,
            blobs,
            lease_epochs: lease_epochs.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Returns the principal's index, or an empty one when nothing is stored
    /// yet or the stored document cannot be fetched or parsed.
    pub async fn load_index(
        &self,
        principal_id: &str,
        kind: IndexKind,
    ) -> Result<IndexDocument, IndexError> {
        let principal_id = checked_principal(principal_id)?;
        match self.fetch(principal_id, kind).await {
            Ok(Loaded::Found(doc)) => Ok(doc),
            Ok(Loaded::Absent) => Ok(IndexDocument::empty(principal_id, kind)),
            Err(err) => {
                metrics::observe_index_fallback(kind.as_str(), "fetch_failed");
                tracing::warn!(
                    event = "index_fetch_failed",
                    principal_id = %principal_id,
                    kind = kind.as_str(),
                    error = %err,
                    "index blob unavailable; serving empty index"
                );
                Ok(IndexDocument::empty(principal_id, kind))
            }
        }
    }

    /// Serializes `doc` into a new blob and points the registry at it.
    pub async fn save_index(&self, doc: &IndexDocument) -> Result<String, IndexError> {
        let principal_id = checked_principal(&doc.principal_id)?;

        let mut doc = doc.clone();
        doc.principal_id = principal_id.to_string();
        doc.dedup_items();
        doc.last_updated = unix_epoch_ms_now();

        let bytes = serde_json::to_vec(&doc)?;
        let receipt = self.blobs.put(bytes, self.lease_epochs).await?;

        let key = NamespacedKey::new(principal_id, doc.kind.purpose());
        let outcome = self.registry.store(&key, &receipt.blob_id).await?;

        tracing::info!(
            principal_id = %principal_id,
            kind = doc.kind.as_str(),
            blob_id = %receipt.blob_id,
            items = doc.items.len(),
            ledger_replicated = outcome.ledger_replicated,
            "index saved"
        );
        Ok(receipt.blob_id)
    }

    pub async fn get_item(
        &self,
        principal_id: &str,
        kind: IndexKind,
        item_id: &str,
    ) -> Result<Option<ItemMetadata>, IndexError> {
        let item_id = checked_item_id(item_id)?;
        let doc = self.load_index(principal_id, kind).await?;
        Ok(doc.get(item_id).cloned())
    }

    /// Inserts or replaces `item`; returns the new index blob ID.
    pub async fn upsert_item(
        &self,
        principal_id: &str,
        kind: IndexKind,
        mut item: ItemMetadata,
    ) -> Result<String, IndexError> {
        let principal_id = checked_principal(principal_id)?;
        item.item_id = checked_item_id(&item.item_id)?.to_string();

        let _guard = self.lock_principal(principal_id, kind).await;

        let mut doc = self.load_for_update(principal_id, kind).await?;
        doc.upsert(item);
        self.save_index(&doc).await
    }

    pub async fn update_item(
        &self,
        principal_id: &str,
        kind: IndexKind,
        item_id: &str,
        update: ItemUpdate,
    ) -> Result<Option<ItemMetadata>, IndexError> {
        self.update_item_where(principal_id, kind, item_id, update, |_| true)
            .await
    }

    /// Applies `update` only while `guard` holds for the current item, checked
    /// under the per-principal lock. `None` when the item is missing or the
    /// guard rejects it.
    pub(crate) async fn update_item_where<F>(
        &self,
        principal_id: &str,
        kind: IndexKind,
        item_id: &str,
        update: ItemUpdate,
        guard: F,
    ) -> Result<Option<ItemMetadata>, IndexError>
    where
        F: FnOnce(&ItemMetadata) -> bool,
    {
        let principal_id = checked_principal(principal_id)?;
        let item_id = checked_item_id(item_id)?;

        let _guard = self.lock_principal(principal_id, kind).await;

        let mut doc = self.load_for_update(principal_id, kind).await?;
        match doc.get(item_id) {
            Some(current) if guard(current) => {}
            _ => return Ok(None),
        }
        if update.is_empty() {
            return Ok(doc.get(item_id).cloned());
        }

        let updated = doc.update(item_id, &update).cloned();
        self.save_index(&doc).await?;
        Ok(updated)
    }

    pub async fn remove_item(
        &self,
        principal_id: &str,
        kind: IndexKind,
        item_id: &str,
    ) -> Result<bool, IndexError> {
        let principal_id = checked_principal(principal_id)?;
        let item_id = checked_item_id(item_id)?;

        let _guard = self.lock_principal(principal_id, kind).await;

        let mut doc = self.load_for_update(principal_id, kind).await?;
        if !doc.remove(item_id) {
            return Ok(false);
        }
        self.save_index(&doc).await?;
        Ok(true)
    }

    /// Like `load_index`, but an index that exists and cannot be fetched is an
    /// error: writing over it would drop every item it holds.
    async fn load_for_update(
        &self,
        principal_id: &str,
        kind: IndexKind,
    ) -> Result<IndexDocument, IndexError> {
        match self.fetch(principal_id, kind).await? {
            Loaded::Found(doc) => Ok(doc),
            Loaded::Absent => Ok(IndexDocument::empty(principal_id, kind)),
        }
    }

    async fn fetch(&self, principal_id: &str, kind: IndexKind) -> Result<Loaded, IndexError> {
        let key = NamespacedKey::new(principal_id, kind.purpose());
        let Some(entry) = self.registry.resolve(&key).await? else {
            return Ok(Loaded::Absent);
        };

        let bytes = self.blobs.get(&entry.blob_id).await?;

        let mut doc = match serde_json::from_slice::<IndexDocument>(&bytes) {
            Ok(doc) => doc,
            Err(err) => {
                metrics::observe_index_fallback(kind.as_str(), "parse_failed");
                tracing::warn!(
                    event = "index_parse_failed",
                    principal_id = %principal_id,
                    kind = kind.as_str(),
                    blob_id = %entry.blob_id,
                    error = %err,
                    "index blob is not a valid index document; treating as empty"
                );
                return Ok(Loaded::Absent);
            }
        };

        if doc.principal_id != principal_id || doc.kind != kind {
            metrics::observe_index_fallback(kind.as_str(), "owner_mismatch");
            tracing::warn!(
                event = "index_owner_mismatch",
                principal_id = %principal_id,
                kind = kind.as_str(),
                blob_id = %entry.blob_id,
                "index blob belongs to another principal or kind; treating as empty"
            );
            return Ok(Loaded::Absent);
        }

        let dropped = doc.dedup_items();
        if dropped > 0 {
            tracing::debug!(
                principal_id = %principal_id,
                kind = kind.as_str(),
                dropped,
                "collapsed duplicate index items"
            );
        }
        Ok(Loaded::Found(doc))
    }

    async fn lock_principal(&self, principal_id: &str, kind: IndexKind) -> PrincipalGuard<'_> {
        let key = (principal_id.to_string(), kind);
        let lock = lock_map(&self.locks).entry(key.clone()).or_default().clone();
        PrincipalGuard {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

/// Holds the per-`(principal, kind)` mutation lock. The map entry is removed
/// on drop once no other task holds or waits on it.
struct PrincipalGuard<'a> {
    locks: &'a LockMap,
    key: LockKey,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for PrincipalGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_map(self.locks);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

fn lock_map(
    locks: &LockMap,
) -> std::sync::MutexGuard<'_, HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>> {
    match locks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn checked_principal(principal_id: &str) -> Result<&str, IndexError> {
    let principal_id = principal_id.trim();
    validate_principal_id(principal_id).map_err(IndexError::InvalidInput)?;
    Ok(principal_id)
}

fn checked_item_id(item_id: &str) -> Result<&str, IndexError> {
    let item_id = item_id.trim();
    if item_id.is_empty() {
        return Err(IndexError::InvalidInput("item_id is required"));
    }
    Ok(item_id)
}
