use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use docvault_contracts::{MetadataEntry, MetadataTier, NamespacedKey, unix_epoch_ms_now};
use docvault_ledger::{LedgerError, MetadataLedger};
use tracing::Instrument;

mod index;
mod lease;
mod local_tier;
mod memory_tier;
pub mod metrics;

pub use index::{DEFAULT_INDEX_LEASE_EPOCHS, IndexError, IndexStore};
pub use lease::{LeasePolicy, LeaseRenewer, RenewalOutcome};
pub use local_tier::LocalTierError;

use local_tier::{LocalRecord, LocalTier};
use memory_tier::{MemoryRecord, MemoryTier};

pub const DEFAULT_LEDGER_SCAN_LIMIT: usize = 256;

#[derive(Debug)]
pub enum RegistryError {
    InvalidInput(&'static str),
    LocalTier(LocalTierError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::InvalidInput(reason) => write!(f, "invalid input: {}", reason),
            RegistryError::LocalTier(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<LocalTierError> for RegistryError {
    fn from(value: LocalTierError) -> Self {
        RegistryError::LocalTier(value)
    }
}

/// What a `store` call achieved. The local tiers are always written when this
/// is returned; the ledger half is best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub blob_id: String,
    pub ledger_replicated: bool,
    /// Present when this call appended a new ledger event.
    pub ledger_event_id: Option<String>,
    /// True when the value was already current and replicated, so no event was
    /// appended.
    pub ledger_append_skipped: bool,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub local_cache_path: PathBuf,
    pub ledger_scan_limit: usize,
}

/// Resolves namespaced keys to blob IDs through the in-process map, the
/// host-local file and finally the ledger.
pub struct MetadataRegistry {
    memory: MemoryTier,
    local: LocalTier,
    ledger: Arc<dyn MetadataLedger>,
    scan_limit: usize,
}

impl MetadataRegistry {
    pub fn new(config: RegistryConfig, ledger: Arc<dyn MetadataLedger>) -> Self {
        metrics::register();
        Self {
            memory: MemoryTier::default(),
            local: LocalTier::new(config.local_cache_path),
            ledger,
            scan_limit: config.ledger_scan_limit.max(1),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn MetadataLedger> {
        &self.ledger
    }

    pub async fn resolve(
        &self,
        key: &NamespacedKey,
    ) -> Result<Option<MetadataEntry>, RegistryError> {
        key.validate().map_err(RegistryError::InvalidInput)?;

        let span = tracing::debug_span!(
            "registry.resolve",
            principal_id = %key.principal_id,
            purpose = key.purpose.as_str(),
            tier = tracing::field::Empty,
        );
        let found = async {
            let found = self.resolve_inner(key).await;
            let tier = found.as_ref().map(|e| e.tier.as_str()).unwrap_or("miss");
            tracing::Span::current().record("tier", tier);
            metrics::observe_resolve(key.purpose.as_str(), tier);
            found
        }
        .instrument(span)
        .await;
        Ok(found)
    }

    async fn resolve_inner(&self, key: &NamespacedKey) -> Option<MetadataEntry> {
        if let Some(record) = self.memory.get(key).await {
            return Some(entry(
                key,
                record.blob_id,
                MetadataTier::Memory,
                record.observed_at_epoch_ms,
            ));
        }

        match self.local.read(key).await {
            Ok(Some(record)) => {
                let observed_at = unix_epoch_ms_now();
                self.memory
                    .put(
                        key.clone(),
                        MemoryRecord {
                            blob_id: record.blob_id.clone(),
                            observed_at_epoch_ms: observed_at,
                            replicated: record.replicated,
                        },
                    )
                    .await;
                return Some(entry(
                    key,
                    record.blob_id,
                    MetadataTier::DurableLocal,
                    observed_at,
                ));
            }
            Ok(None) => {}
            Err(err) => {
                metrics::observe_tier_failure(MetadataTier::DurableLocal.as_str(), "read");
                tracing::warn!(
                    event = "local_tier_read_failed",
                    principal_id = %key.principal_id,
                    purpose = key.purpose.as_str(),
                    path = %self.local.path().display(),
                    error = %err,
                    "local tier read failed; treating as miss"
                );
            }
        }

        let blob_id = self.scan_ledger(key).await?;
        let observed_at = unix_epoch_ms_now();
        let (blob_id, tier) = self.backfill(key, blob_id, observed_at).await;
        Some(entry(key, blob_id, tier, observed_at))
    }

    async fn scan_ledger(&self, key: &NamespacedKey) -> Option<String> {
        let started = Instant::now();
        let result = self
            .ledger
            .scan_newest_first(&key.principal_id, key.purpose.ledger_tag(), self.scan_limit)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let events = match result {
            Ok(events) => events,
            Err(err) => {
                metrics::observe_tier_failure(MetadataTier::Ledger.as_str(), "scan");
                tracing::warn!(
                    event = "ledger_scan_failed",
                    principal_id = %key.principal_id,
                    purpose = key.purpose.as_str(),
                    latency_ms,
                    timeout = matches!(err, LedgerError::Timeout),
                    error = %err,
                    "ledger scan failed; treating as miss"
                );
                return None;
            }
        };

        // The prefix only narrows the scan; every value's tag is re-checked.
        let found = events
            .iter()
            .filter(|event| event.principal_id == key.principal_id)
            .find_map(|event| key.purpose.strip_tag(&event.value))
            .map(str::to_string);

        tracing::debug!(
            principal_id = %key.principal_id,
            purpose = key.purpose.as_str(),
            scanned = events.len(),
            hit = found.is_some(),
            latency_ms,
            "ledger scan complete"
        );
        found
    }

    /// Back-fills a ledger hit without overwriting anything a concurrent
    /// `store` wrote while the scan was in flight. Returns the value the
    /// tiers hold afterwards and where it came from.
    async fn backfill(
        &self,
        key: &NamespacedKey,
        ledger_blob_id: String,
        observed_at: i64,
    ) -> (String, MetadataTier) {
        let candidate = LocalRecord {
            blob_id: ledger_blob_id.clone(),
            updated_at_epoch_ms: observed_at,
            replicated: true,
        };
        let winner = match self.local.insert_if_absent(key, candidate.clone()).await {
            Ok(record) => record,
            Err(err) => {
                metrics::observe_tier_failure(MetadataTier::DurableLocal.as_str(), "backfill");
                tracing::warn!(
                    event = "local_tier_backfill_failed",
                    principal_id = %key.principal_id,
                    purpose = key.purpose.as_str(),
                    error = %err,
                    "failed to back-fill local tier from ledger"
                );
                candidate
            }
        };

        let held = self
            .memory
            .insert_if_absent(
                key.clone(),
                MemoryRecord {
                    blob_id: winner.blob_id,
                    observed_at_epoch_ms: observed_at,
                    replicated: winner.replicated,
                },
            )
            .await;

        if held.blob_id == ledger_blob_id {
            (held.blob_id, MetadataTier::Ledger)
        } else {
            tracing::debug!(
                principal_id = %key.principal_id,
                purpose = key.purpose.as_str(),
                "newer local value landed during ledger scan; keeping it"
            );
            (held.blob_id, MetadataTier::DurableLocal)
        }
    }

    /// Writes the host-local tiers, then replicates to the ledger without
    /// holding any local lock. A ledger failure does not fail the store.
    pub async fn store(
        &self,
        key: &NamespacedKey,
        blob_id: &str,
    ) -> Result<StoreOutcome, RegistryError> {
        key.validate().map_err(RegistryError::InvalidInput)?;
        docvault_contracts::validate_blob_id(blob_id).map_err(RegistryError::InvalidInput)?;

        let span = tracing::info_span!(
            "registry.store",
            principal_id = %key.principal_id,
            purpose = key.purpose.as_str(),
            blob_id = %blob_id,
        );
        self.store_inner(key, blob_id).instrument(span).await
    }

    async fn store_inner(
        &self,
        key: &NamespacedKey,
        blob_id: &str,
    ) -> Result<StoreOutcome, RegistryError> {
        let already_replicated = self
            .memory
            .get(key)
            .await
            .is_some_and(|record| record.blob_id == blob_id && record.replicated);

        let now = unix_epoch_ms_now();
        self.local
            .write(
                key,
                LocalRecord {
                    blob_id: blob_id.to_string(),
                    updated_at_epoch_ms: now,
                    replicated: already_replicated,
                },
            )
            .await
            .inspect_err(|_| {
                metrics::observe_tier_failure(MetadataTier::DurableLocal.as_str(), "write");
            })?;
        self.memory
            .put(
                key.clone(),
                MemoryRecord {
                    blob_id: blob_id.to_string(),
                    observed_at_epoch_ms: now,
                    replicated: already_replicated,
                },
            )
            .await;

        if already_replicated {
            metrics::observe_replication(key.purpose.as_str(), "skipped");
            tracing::debug!("value already current on ledger; skipping append");
            return Ok(StoreOutcome {
                blob_id: blob_id.to_string(),
                ledger_replicated: true,
                ledger_event_id: None,
                ledger_append_skipped: true,
            });
        }

        let started = Instant::now();
        let value = key.purpose.tag_value(blob_id);
        match self.ledger.append(&key.principal_id, &value).await {
            Ok(event_id) => {
                self.memory.mark_replicated(key, blob_id).await;
                if let Err(err) = self.local.mark_replicated(key, blob_id).await {
                    tracing::warn!(
                        event = "local_tier_mark_failed",
                        error = %err,
                        "could not record replication in local tier"
                    );
                }
                metrics::observe_replication(key.purpose.as_str(), "replicated");
                tracing::debug!(
                    event_id = %event_id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "ledger replication complete"
                );
                Ok(StoreOutcome {
                    blob_id: blob_id.to_string(),
                    ledger_replicated: true,
                    ledger_event_id: Some(event_id),
                    ledger_append_skipped: false,
                })
            }
            Err(err) => {
                metrics::observe_tier_failure(MetadataTier::Ledger.as_str(), "append");
                metrics::observe_replication(key.purpose.as_str(), "failed");
                tracing::warn!(
                    event = "ledger_replication_failed",
                    latency_ms = started.elapsed().as_millis() as u64,
                    timeout = matches!(err, LedgerError::Timeout),
                    error = %err,
                    "ledger append failed; value kept in local tiers only"
                );
                Ok(StoreOutcome {
                    blob_id: blob_id.to_string(),
                    ledger_replicated: false,
                    ledger_event_id: None,
                    ledger_append_skipped: false,
                })
            }
        }
    }
}

fn entry(
    key: &NamespacedKey,
    blob_id: String,
    tier: MetadataTier,
    observed_at: i64,
) -> MetadataEntry {
    MetadataEntry {
        key: key.clone(),
        blob_id,
        tier,
        observed_at_epoch_ms: observed_at,
    }
}
