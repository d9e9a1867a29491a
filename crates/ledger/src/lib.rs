use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docvault_contracts::{canonical, unix_epoch_ms_now};
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use ulid::Ulid;

/// The single event type carried by the metadata stream.
pub const METADATA_UPDATED: &str = "METADATA_UPDATED";

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    Unavailable(String),
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "ledger operation timed out"),
            LedgerError::Unavailable(reason) => write!(f, "ledger unavailable: {}", reason),
            LedgerError::Sqlx(err) => write!(f, "ledger sql error: {}", err),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        LedgerError::Sqlx(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEvent {
    pub event_id: String,
    pub event_type: String,
    pub principal_id: String,
    pub value: String,
    pub payload_hash: String,
    pub recorded_at_epoch_ms: i64,
}

fn payload_hash(principal_id: &str, value: &str) -> String {
    canonical::hash_canonical_json(&serde_json::json!({
        "event_type": METADATA_UPDATED,
        "principal_id": principal_id,
        "value": value,
    }))
}

/// Append-only, principal-keyed metadata event log.
#[async_trait]
pub trait MetadataLedger: Send + Sync {
    /// Appends a `METADATA_UPDATED` event and returns its event ID.
    async fn append(&self, principal_id: &str, value: &str) -> Result<String, LedgerError>;

    /// Returns up to `limit` events for `principal_id` whose value starts with
    /// `value_prefix`, newest first.
    async fn scan_newest_first(
        &self,
        principal_id: &str,
        value_prefix: &str,
        limit: usize,
    ) -> Result<Vec<MetadataEvent>, LedgerError>;

    async fn ping(&self) -> Result<(), LedgerError>;
}

#[derive(Clone)]
pub struct PgLedger {
    pool: sqlx::PgPool,
    timeout: Duration,
}

impl PgLedger {
    pub async fn connect(db_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(Self { pool, timeout })
    }

    pub async fn connect_and_migrate(db_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let ledger = Self::connect(db_url, timeout).await?;
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub async fn migrate(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MetadataLedger for PgLedger {
    async fn append(&self, principal_id: &str, value: &str) -> Result<String, LedgerError> {
        let event_id = Ulid::new().to_string();
        let payload_hash = payload_hash(principal_id, value);

        tokio::time::timeout(
            self.timeout,
            sqlx::query(
                "INSERT INTO docvault_metadata_events (event_id, event_type, principal_id, value, payload_hash) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&event_id)
            .bind(METADATA_UPDATED)
            .bind(principal_id)
            .bind(value)
            .bind(&payload_hash)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        Ok(event_id)
    }

    async fn scan_newest_first(
        &self,
        principal_id: &str,
        value_prefix: &str,
        limit: usize,
    ) -> Result<Vec<MetadataEvent>, LedgerError> {
        let limit = limit.min(i64::MAX as usize) as i64;

        let rows = tokio::time::timeout(
            self.timeout,
            sqlx::query(
                "SELECT event_id, event_type, principal_id, value, payload_hash, (EXTRACT(EPOCH FROM recorded_at) * 1000)::BIGINT AS recorded_at_ms FROM docvault_metadata_events WHERE event_type = $1 AND principal_id = $2 AND starts_with(value, $3) ORDER BY seq DESC LIMIT $4",
            )
            .bind(METADATA_UPDATED)
            .bind(principal_id)
            .bind(value_prefix)
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await
        .map_err(|_| LedgerError::Timeout)??;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(MetadataEvent {
                event_id: row.try_get("event_id")?,
                event_type: row.try_get("event_type")?,
                principal_id: row.try_get("principal_id")?,
                value: row.try_get("value")?,
                payload_hash: row.try_get("payload_hash")?,
                recorded_at_epoch_ms: row.try_get("recorded_at_ms")?,
            });
        }
        Ok(events)
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        tokio::time::timeout(self.timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| LedgerError::Timeout)??;
        Ok(())
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn migrate_url(db_url: &str) -> Result<(), sqlx::Error> {
    let pool = sqlx::PgPool::connect(db_url).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Process-local ledger for development and tests. It keeps the append-only
/// contract and counts calls so callers can assert which tiers were consulted.
#[derive(Default)]
pub struct MemoryLedger {
    events: Mutex<Vec<MetadataEvent>>,
    offline: AtomicBool,
    append_calls: AtomicUsize,
    scan_calls: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unreachable ledger: every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn event_count(&self) -> usize {
        self.lock_events().len()
    }

    fn lock_events(&self) -> std::sync::MutexGuard<'_, Vec<MetadataEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_online(&self) -> Result<(), LedgerError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("memory ledger offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataLedger for MemoryLedger {
    async fn append(&self, principal_id: &str, value: &str) -> Result<String, LedgerError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let event = MetadataEvent {
            event_id: Ulid::new().to_string(),
            event_type: METADATA_UPDATED.to_string(),
            principal_id: principal_id.to_string(),
            value: value.to_string(),
            payload_hash: payload_hash(principal_id, value),
            recorded_at_epoch_ms: unix_epoch_ms_now(),
        };
        let event_id = event.event_id.clone();
        self.lock_events().push(event);
        Ok(event_id)
    }

    async fn scan_newest_first(
        &self,
        principal_id: &str,
        value_prefix: &str,
        limit: usize,
    ) -> Result<Vec<MetadataEvent>, LedgerError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let events = self.lock_events();
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.event_type == METADATA_UPDATED)
            .filter(|e| e.principal_id == principal_id && e.value.starts_with(value_prefix))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.check_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_ledger_scans_newest_first_with_prefix_filter() {
        let ledger = MemoryLedger::new();
        ledger.append("p1", "chat:b1").await.expect("append");
        ledger.append("p1", "docs:d1").await.expect("append");
        ledger.append("p1", "chat:b2").await.expect("append");
        ledger.append("p2", "chat:other").await.expect("append");

        let events = ledger
            .scan_newest_first("p1", "chat:", 10)
            .await
            .expect("scan");
        let values = events.iter().map(|e| e.value.as_str()).collect::<Vec<_>>();
        assert_eq!(values, vec!["chat:b2", "chat:b1"]);

        let limited = ledger
            .scan_newest_first("p1", "chat:", 1)
            .await
            .expect("scan");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].value, "chat:b2");
    }

    #[tokio::test]
    async fn offline_memory_ledger_fails_every_call_but_counts_it() {
        let ledger = MemoryLedger::new();
        ledger.set_offline(true);

        assert!(matches!(
            ledger.append("p1", "chat:b1").await,
            Err(LedgerError::Unavailable(_))
        ));
        assert!(ledger.scan_newest_first("p1", "chat:", 1).await.is_err());
        assert!(ledger.ping().await.is_err());
        assert_eq!(ledger.append_calls(), 1);
        assert_eq!(ledger.scan_calls(), 1);
        assert_eq!(ledger.event_count(), 0);
    }

    #[test]
    fn payload_hash_binds_principal_and_value() {
        assert_eq!(payload_hash("p1", "chat:b1"), payload_hash("p1", "chat:b1"));
        assert_ne!(payload_hash("p1", "chat:b1"), payload_hash("p2", "chat:b1"));
        assert!(canonical::is_content_digest(&payload_hash("p1", "chat:b1")));
    }
}
