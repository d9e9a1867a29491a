use std::sync::Arc;

use docvault_contracts::{IndexKind, ItemMetadata, ItemUpdate, unix_epoch_ms_now};

use crate::{IndexError, IndexStore, metrics};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub renewal_window_ms: i64,
    pub recency_window_ms: i64,
    pub standard_period_epochs: u32,
    pub max_period_epochs: u32,
    pub epoch_duration_ms: i64,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            renewal_window_ms: 7 * DAY_MS,
            recency_window_ms: 30 * DAY_MS,
            standard_period_epochs: 30,
            max_period_epochs: 90,
            epoch_duration_ms: DAY_MS,
        }
    }
}

impl LeasePolicy {
    /// True only while the blob is still alive and inside the renewal window.
    /// An expired blob is gone and cannot be renewed.
    pub fn needs_renewal(&self, item: &ItemMetadata, now_ms: i64) -> bool {
        let remaining = item.blob_expires_at.saturating_sub(now_ms);
        remaining > 0 && remaining < self.renewal_window_ms
    }

    /// Lease length in epochs for the next upload; `0` means let it lapse.
    pub fn recommended_lease_period(&self, item: &ItemMetadata, now_ms: i64) -> u32 {
        if item.is_important {
            return self.max_period_epochs;
        }
        if now_ms.saturating_sub(item.last_activity) < self.recency_window_ms {
            return self.standard_period_epochs;
        }
        0
    }

    pub fn expires_at(&self, now_ms: i64, period_epochs: u32) -> i64 {
        now_ms.saturating_add(self.epoch_duration_ms.saturating_mul(i64::from(period_epochs)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    Renewed {
        new_blob_id: String,
        lease_period: u32,
        blob_expires_at: i64,
    },
    ItemNotFound,
    NotDue,
    Expired,
    LetLapse,
    /// The item changed while its content was being re-uploaded.
    Superseded,
}

impl RenewalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalOutcome::Renewed { .. } => "renewed",
            RenewalOutcome::ItemNotFound => "item_not_found",
            RenewalOutcome::NotDue => "not_due",
            RenewalOutcome::Expired => "expired",
            RenewalOutcome::LetLapse => "let_lapse",
            RenewalOutcome::Superseded => "superseded",
        }
    }
}

/// Applies the lease policy lazily when an item is accessed.
pub struct LeaseRenewer {
    index: Arc<IndexStore>,
    policy: LeasePolicy,
}

impl LeaseRenewer {
    pub fn new(index: Arc<IndexStore>, policy: LeasePolicy) -> Self {
        Self { index, policy }
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }

    pub async fn check_and_renew(
        &self,
        principal_id: &str,
        kind: IndexKind,
        item_id: &str,
    ) -> Result<RenewalOutcome, IndexError> {
        self.check_and_renew_at(principal_id, kind, item_id, unix_epoch_ms_now())
            .await
    }

    pub async fn check_and_renew_at(
        &self,
        principal_id: &str,
        kind: IndexKind,
        item_id: &str,
        now_ms: i64,
    ) -> Result<RenewalOutcome, IndexError> {
        let outcome = self.renew(principal_id, kind, item_id, now_ms).await;
        let label = match &outcome {
            Ok(outcome) => outcome.as_str(),
            Err(_) => "error",
        };
        metrics::observe_lease_renewal(kind.as_str(), label);
        outcome
    }

    async fn renew(
        &self,
        principal_id: &str,
        kind: IndexKind,
        item_id: &str,
        now_ms: i64,
    ) -> Result<RenewalOutcome, IndexError> {
        let Some(item) = self.index.get_item(principal_id, kind, item_id).await? else {
            return Ok(RenewalOutcome::ItemNotFound);
        };

        if item.blob_expires_at <= now_ms {
            return Ok(RenewalOutcome::Expired);
        }
        if !self.policy.needs_renewal(&item, now_ms) {
            return Ok(RenewalOutcome::NotDue);
        }
        let period = self.policy.recommended_lease_period(&item, now_ms);
        if period == 0 {
            tracing::debug!(
                principal_id = %principal_id,
                item_id = %item_id,
                "item inactive; letting lease lapse"
            );
            return Ok(RenewalOutcome::LetLapse);
        }

        let blobs = self.index.blobs();
        let content = blobs.get(&item.content_blob_id).await?;
        let receipt = blobs.put(content, period).await?;
        let blob_expires_at = self.policy.expires_at(now_ms, period);

        let old_blob_id = item.content_blob_id.clone();
        let updated = self
            .index
            .update_item_where(
                principal_id,
                kind,
                item_id,
                ItemUpdate {
                    content_blob_id: Some(receipt.blob_id.clone()),
                    blob_expires_at: Some(blob_expires_at),
                    current_lease_period: Some(period),
                    ..ItemUpdate::default()
                },
                |current| current.content_blob_id == old_blob_id,
            )
            .await?;

        if updated.is_none() {
            tracing::warn!(
                event = "lease_renewal_superseded",
                principal_id = %principal_id,
                item_id = %item_id,
                orphaned_blob_id = %receipt.blob_id,
                "item changed during renewal; discarding renewed copy"
            );
            return Ok(RenewalOutcome::Superseded);
        }

        tracing::info!(
            principal_id = %principal_id,
            kind = kind.as_str(),
            item_id = %item_id,
            old_blob_id = %old_blob_id,
            blob_id = %receipt.blob_id,
            lease_period = period,
            "lease renewed"
        );
        Ok(RenewalOutcome::Renewed {
            new_blob_id: receipt.blob_id,
            lease_period: period,
            blob_expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use docvault_blobstore::{BlobStore, BlobStoreError, MemoryBlobStore};
    use docvault_ledger::MemoryLedger;

    use crate::{MetadataRegistry, RegistryConfig};

    const NOW: i64 = 1_800_000_000_000;

    fn item(expires_in_ms: i64, last_active_ago_ms: i64, important: bool) -> ItemMetadata {
        ItemMetadata {
            item_id: "c1".to_string(),
            title: "chat".to_string(),
            created_at: NOW - 90 * DAY_MS,
            last_activity: NOW - last_active_ago_ms,
            content_blob_id: "content-c1".to_string(),
            blob_expires_at: NOW + expires_in_ms,
            current_lease_period: 30,
            is_important: important,
            owner: "0xp1".to_string(),
        }
    }

    #[test]
    fn renewal_window_boundaries() {
        let policy = LeasePolicy::default();
        assert!(policy.needs_renewal(&item(3 * DAY_MS, 0, false), NOW));
        assert!(!policy.needs_renewal(&item(10 * DAY_MS, 0, false), NOW));
        assert!(!policy.needs_renewal(&item(7 * DAY_MS, 0, false), NOW));
        assert!(policy.needs_renewal(&item(1, 0, false), NOW));
    }

    #[test]
    fn expired_items_are_final() {
        let policy = LeasePolicy::default();
        assert!(!policy.needs_renewal(&item(0, 0, true), NOW));
        assert!(!policy.needs_renewal(&item(-DAY_MS, 0, true), NOW));
    }

    #[test]
    fn lease_period_depends_on_importance_then_recency() {
        let policy = LeasePolicy::default();
        assert_eq!(
            policy.recommended_lease_period(&item(DAY_MS, 365 * DAY_MS, true), NOW),
            90
        );
        assert_eq!(
            policy.recommended_lease_period(&item(DAY_MS, 2 * DAY_MS, false), NOW),
            30
        );
        assert_eq!(
            policy.recommended_lease_period(&item(DAY_MS, 45 * DAY_MS, false), NOW),
            0
        );
    }

    struct Harness {
        _dir: tempfile::TempDir,
        blobs: Arc<MemoryBlobStore>,
        index: Arc<IndexStore>,
        renewer: LeaseRenewer,
    }

    async fn harness_with(item: ItemMetadata) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(MetadataRegistry::new(
            RegistryConfig {
                local_cache_path: dir.path().join("cache.json"),
                ledger_scan_limit: 16,
            },
            Arc::new(MemoryLedger::new()),
        ));
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert(&item.content_blob_id, "hello");
        let index = Arc::new(IndexStore::new(registry, blobs.clone(), 30));
        index
            .upsert_item("0xp1", IndexKind::Chat, item)
            .await
            .expect("seed item");
        let renewer = LeaseRenewer::new(index.clone(), LeasePolicy::default());
        Harness {
            _dir: dir,
            blobs,
            index,
            renewer,
        }
    }

    #[tokio::test]
    async fn due_active_item_is_reuploaded_under_new_blob_id() {
        let h = harness_with(item(3 * DAY_MS, DAY_MS, false)).await;

        let outcome = h
            .renewer
            .check_and_renew_at("0xp1", IndexKind::Chat, "c1", NOW)
            .await
            .expect("renew");
        let (new_blob_id, lease_period, blob_expires_at) = match outcome {
            RenewalOutcome::Renewed {
                new_blob_id,
                lease_period,
                blob_expires_at,
            } => (new_blob_id, lease_period, blob_expires_at),
            other => panic!("expected renewal, got {:?}", other),
        };
        assert_ne!(new_blob_id, "content-c1");
        assert_eq!(lease_period, 30);
        assert_eq!(blob_expires_at, NOW + 30 * DAY_MS);

        let stored = h
            .index
            .get_item("0xp1", IndexKind::Chat, "c1")
            .await
            .expect("get")
            .expect("item");
        assert_eq!(stored.content_blob_id, new_blob_id);
        assert_eq!(stored.current_lease_period, 30);
        assert_eq!(h.blobs.get(&new_blob_id).await.expect("get"), b"hello".to_vec());
    }

    #[tokio::test]
    async fn not_due_expired_and_inactive_items_do_not_upload() {
        for (seed, expected) in [
            (item(10 * DAY_MS, DAY_MS, false), RenewalOutcome::NotDue),
            (item(-DAY_MS, DAY_MS, true), RenewalOutcome::Expired),
            (item(3 * DAY_MS, 60 * DAY_MS, false), RenewalOutcome::LetLapse),
        ] {
            let h = harness_with(seed).await;
            let puts = h.blobs.put_calls();
            let outcome = h
                .renewer
                .check_and_renew_at("0xp1", IndexKind::Chat, "c1", NOW)
                .await
                .expect("check");
            assert_eq!(outcome, expected);
            assert_eq!(h.blobs.put_calls(), puts);
        }
    }

    #[tokio::test]
    async fn missing_item_reports_not_found() {
        let h = harness_with(item(3 * DAY_MS, DAY_MS, false)).await;
        let outcome = h
            .renewer
            .check_and_renew_at("0xp1", IndexKind::Document, "c1", NOW)
            .await
            .expect("check");
        assert_eq!(outcome, RenewalOutcome::ItemNotFound);
    }

    #[tokio::test]
    async fn unreadable_content_is_an_error_and_leaves_item_untouched() {
        let h = harness_with(item(3 * DAY_MS, DAY_MS, true)).await;
        h.blobs.mark_unreadable("content-c1");

        assert!(
            h.renewer
                .check_and_renew_at("0xp1", IndexKind::Chat, "c1", NOW)
                .await
                .is_err()
        );
        let stored = h
            .index
            .get_item("0xp1", IndexKind::Chat, "c1")
            .await
            .expect("get")
            .expect("item");
        assert_eq!(stored.content_blob_id, "content-c1");
    }

    /// Edits the item's content reference the first time content is
    /// uploaded, as a concurrent writer would between renewal read and write.
    struct EditingBlobStore {
        inner: Arc<MemoryBlobStore>,
        index: std::sync::OnceLock<Arc<IndexStore>>,
        armed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl BlobStore for EditingBlobStore {
        async fn put(
            &self,
            bytes: Vec<u8>,
            lease_epochs: u32,
        ) -> Result<docvault_blobstore::BlobReceipt, BlobStoreError> {
            let edit = self.armed.swap(false, std::sync::atomic::Ordering::SeqCst);
            if let (true, Some(index)) = (edit, self.index.get()) {
                index
                    .update_item(
                        "0xp1",
                        IndexKind::Chat,
                        "c1",
                        ItemUpdate {
                            content_blob_id: Some("content-edited".to_string()),
                            ..ItemUpdate::default()
                        },
                    )
                    .await
                    .expect("concurrent edit");
            }
            self.inner.put(bytes, lease_epochs).await
        }

        async fn get(&self, blob_id: &str) -> Result<Vec<u8>, BlobStoreError> {
            self.inner.get(blob_id).await
        }

        async fn head(&self, blob_id: &str) -> Result<bool, BlobStoreError> {
            self.inner.head(blob_id).await
        }
    }

    #[tokio::test]
    async fn edit_during_renewal_upload_supersedes_the_renewal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(MetadataRegistry::new(
            RegistryConfig {
                local_cache_path: dir.path().join("cache.json"),
                ledger_scan_limit: 16,
            },
            Arc::new(MemoryLedger::new()),
        ));
        let inner = Arc::new(MemoryBlobStore::new());
        inner.insert("content-c1", "hello");
        let blobs = Arc::new(EditingBlobStore {
            inner: inner.clone(),
            index: std::sync::OnceLock::new(),
            armed: std::sync::atomic::AtomicBool::new(false),
        });
        let index = Arc::new(IndexStore::new(registry, blobs.clone(), 30));
        let _ = blobs.index.set(index.clone());
        index
            .upsert_item("0xp1", IndexKind::Chat, item(3 * DAY_MS, DAY_MS, false))
            .await
            .expect("seed item");
        let renewer = LeaseRenewer::new(index.clone(), LeasePolicy::default());

        blobs.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        let outcome = renewer
            .check_and_renew_at("0xp1", IndexKind::Chat, "c1", NOW)
            .await
            .expect("renew");
        assert_eq!(outcome, RenewalOutcome::Superseded);

        let stored = index
            .get_item("0xp1", IndexKind::Chat, "c1")
            .await
            .expect("get")
            .expect("item");
        assert_eq!(stored.content_blob_id, "content-edited");
        assert_eq!(stored.blob_expires_at, NOW + 3 * DAY_MS);
    }
}
