use std::sync::Arc;
use std::time::Duration;

use docvault_blobstore::{BlobStore, HttpBlobStore, HttpBlobStoreConfig, MemoryBlobStore};
use docvault_ledger::{MemoryLedger, MetadataLedger, PgLedger};
use docvault_query::{HttpPolicySource, MemoryPolicySource, PipelineConfig, PolicySource};
use docvault_registry::{
    IndexStore, LeasePolicy, LeaseRenewer, MetadataRegistry, RegistryConfig,
};

use crate::config::{BlobMode, LedgerMode, NodeConfig, StartupError};

/// Process-wide components, built once and shared by `Arc`.
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<dyn MetadataLedger>,
    pub blobs: Arc<dyn BlobStore>,
    pub registry: Arc<MetadataRegistry>,
    pub index: Arc<IndexStore>,
    pub renewer: Arc<LeaseRenewer>,
    pub policies: Arc<dyn PolicySource>,
    pub pipeline_config: PipelineConfig,
}

impl Services {
    pub async fn build(config: &NodeConfig) -> Result<Self, StartupError> {
        let ledger = build_ledger(config).await?;
        let blobs = build_blob_store(config)?;

        let registry = Arc::new(MetadataRegistry::new(
            RegistryConfig {
                local_cache_path: config.local_cache_path.clone().into(),
                ledger_scan_limit: config.ledger_scan_limit,
            },
            ledger.clone(),
        ));
        let index = Arc::new(IndexStore::new(
            registry.clone(),
            blobs.clone(),
            config.index_lease_epochs,
        ));
        let renewer = Arc::new(LeaseRenewer::new(index.clone(), lease_policy(config)));
        let policies = build_policy_source(config)?;

        Ok(Self {
            ledger,
            blobs,
            registry,
            index,
            renewer,
            policies,
            pipeline_config: PipelineConfig {
                max_fanout: config.query_max_fanout,
                max_parallelism: config.query_max_parallelism,
            },
        })
    }
}

pub fn lease_policy(config: &NodeConfig) -> LeasePolicy {
    let ms = |v: u64| v.min(i64::MAX as u64) as i64;
    LeasePolicy {
        renewal_window_ms: ms(config.renewal_window_ms),
        recency_window_ms: ms(config.recency_window_ms),
        standard_period_epochs: config.lease_standard_epochs,
        max_period_epochs: config.lease_max_epochs,
        epoch_duration_ms: ms(config.epoch_duration_ms),
    }
}

async fn build_ledger(config: &NodeConfig) -> Result<Arc<dyn MetadataLedger>, StartupError> {
    match config.ledger_mode {
        LedgerMode::Memory => {
            tracing::warn!("using in-memory ledger; metadata will not survive host loss");
            Ok(Arc::new(MemoryLedger::new()))
        }
        LedgerMode::Postgres => {
            let db_url = config.db_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "missing required config key DOCVAULT_DB_URL".to_string(),
            })?;
            let ledger = PgLedger::connect_and_migrate(
                db_url,
                Duration::from_millis(config.ledger_timeout_ms),
            )
            .await
            .map_err(|err| StartupError {
                code: "ERR_LEDGER_UNAVAILABLE",
                message: format!("failed to initialize ledger: {}", err),
            })?;
            Ok(Arc::new(ledger))
        }
    }
}

fn build_blob_store(config: &NodeConfig) -> Result<Arc<dyn BlobStore>, StartupError> {
    match config.blob_mode {
        BlobMode::Memory => Ok(Arc::new(MemoryBlobStore::new())),
        BlobMode::Http => {
            let (Some(publisher_url), Some(aggregator_url)) = (
                config.blob_publisher_url.clone(),
                config.blob_aggregator_url.clone(),
            ) else {
                return Err(StartupError {
                    code: "ERR_MISSING_CONFIG",
                    message: "http blob mode requires publisher and aggregator URLs".to_string(),
                });
            };
            let store = HttpBlobStore::new(HttpBlobStoreConfig {
                publisher_url,
                aggregator_url,
                timeout: Duration::from_millis(config.blob_timeout_ms),
            })
            .map_err(|_| StartupError {
                code: "ERR_BLOB_STORE_UNAVAILABLE",
                message: "failed to initialize blob store client".to_string(),
            })?;
            Ok(Arc::new(store))
        }
    }
}

fn build_policy_source(config: &NodeConfig) -> Result<Arc<dyn PolicySource>, StartupError> {
    let Some(policy_url) = config.policy_url.clone() else {
        tracing::warn!(
            "no DOCVAULT_POLICY_URL configured; every resource is treated as having no policy"
        );
        return Ok(Arc::new(MemoryPolicySource::new()));
    };

    let source = HttpPolicySource::new(
        policy_url,
        Duration::from_millis(config.policy_timeout_ms),
        config.policy_cache_max_entries,
        Duration::from_millis(config.policy_cache_ttl_ms),
    )
    .map_err(|_| StartupError {
        code: "ERR_POLICY_UNAVAILABLE",
        message: "failed to initialize policy client".to_string(),
    })?;
    Ok(Arc::new(source))
}
