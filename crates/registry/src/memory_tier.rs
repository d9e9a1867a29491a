use std::collections::HashMap;
use std::sync::Arc;

use docvault_contracts::NamespacedKey;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemoryRecord {
    pub blob_id: String,
    pub observed_at_epoch_ms: i64,
    /// Set once the value is known to be present on the ledger.
    pub replicated: bool,
}

/// Process-local view of resolved keys. Same-key writes are last-write-wins.
#[derive(Clone, Default)]
pub(crate) struct MemoryTier {
    entries: Arc<RwLock<HashMap<NamespacedKey, MemoryRecord>>>,
}

impl MemoryTier {
    pub async fn get(&self, key: &NamespacedKey) -> Option<MemoryRecord> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn put(&self, key: NamespacedKey, record: MemoryRecord) {
        self.entries.write().await.insert(key, record);
    }

    /// Inserts `record` unless `key` already has a value; returns whichever
    /// record the tier holds afterwards.
    pub async fn insert_if_absent(
        &self,
        key: NamespacedKey,
        record: MemoryRecord,
    ) -> MemoryRecord {
        self.entries
            .write()
            .await
            .entry(key)
            .or_insert(record)
            .clone()
    }

    /// Flags the entry as replicated only if it still holds `blob_id`; a newer
    /// concurrent store must not inherit the flag.
    pub async fn mark_replicated(&self, key: &NamespacedKey, blob_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(record) = entries.get_mut(key)
            && record.blob_id == blob_id
        {
            record.replicated = true;
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
