use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use docvault_contracts::NamespacedKey;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum LocalTierError {
    Io(std::io::Error),
    Format(serde_json::Error),
}

impl std::fmt::Display for LocalTierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocalTierError::Io(err) => write!(f, "local metadata cache I/O error: {}", err),
            LocalTierError::Format(err) => write!(f, "local metadata cache is malformed: {}", err),
        }
    }
}

impl std::error::Error for LocalTierError {}

impl From<std::io::Error> for LocalTierError {
    fn from(value: std::io::Error) -> Self {
        LocalTierError::Io(value)
    }
}

impl From<serde_json::Error> for LocalTierError {
    fn from(value: serde_json::Error) -> Self {
        LocalTierError::Format(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LocalRecord {
    pub blob_id: String,
    #[serde(default)]
    pub updated_at_epoch_ms: i64,
    #[serde(default)]
    pub replicated: bool,
}

/// Snapshot values may be a bare blob ID (older cache files) or a full record.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Record(LocalRecord),
    Bare(String),
}

impl From<StoredValue> for LocalRecord {
    fn from(value: StoredValue) -> Self {
        match value {
            StoredValue::Record(record) => record,
            StoredValue::Bare(blob_id) => LocalRecord {
                blob_id,
                updated_at_epoch_ms: 0,
                replicated: false,
            },
        }
    }
}

type Snapshot = BTreeMap<String, LocalRecord>;

/// Host-local JSON map keyed by rendered namespaced key. Reads go to disk every
/// time so writes from other processes on the host are observed; writes
/// replace the whole file through a rename.
pub(crate) struct LocalTier {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalTier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self, key: &NamespacedKey) -> Result<Option<LocalRecord>, LocalTierError> {
        let mut snapshot = read_snapshot(&self.path).await?;
        Ok(snapshot.remove(&key.render()))
    }

    pub async fn write(
        &self,
        key: &NamespacedKey,
        record: LocalRecord,
    ) -> Result<(), LocalTierError> {
        let _guard = self.write_lock.lock().await;

        let mut snapshot = self.snapshot_for_write().await?;
        snapshot.insert(key.render(), record);
        write_snapshot(&self.path, &snapshot).await
    }

    /// Stores `record` only when `key` has no value yet. Returns the record
    /// the file holds afterwards, which is the existing one if there was one.
    pub async fn insert_if_absent(
        &self,
        key: &NamespacedKey,
        record: LocalRecord,
    ) -> Result<LocalRecord, LocalTierError> {
        let _guard = self.write_lock.lock().await;

        let mut snapshot = self.snapshot_for_write().await?;
        let rendered = key.render();
        if let Some(existing) = snapshot.get(&rendered) {
            return Ok(existing.clone());
        }
        snapshot.insert(rendered, record.clone());
        write_snapshot(&self.path, &snapshot).await?;
        Ok(record)
    }

    /// Current snapshot for a read-modify-write; a malformed file is replaced.
    /// Callers hold `write_lock`.
    async fn snapshot_for_write(&self) -> Result<Snapshot, LocalTierError> {
        match read_snapshot(&self.path).await {
            Ok(snapshot) => Ok(snapshot),
            Err(LocalTierError::Format(err)) => {
                tracing::warn!(
                    event = "local_tier_reset",
                    path = %self.path.display(),
                    error = %err,
                    "local metadata cache unreadable; rewriting from scratch"
                );
                Ok(Snapshot::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Sets the replicated flag when the stored value is still `blob_id`.
    /// Returns whether the file changed.
    pub async fn mark_replicated(
        &self,
        key: &NamespacedKey,
        blob_id: &str,
    ) -> Result<bool, LocalTierError> {
        let _guard = self.write_lock.lock().await;

        let mut snapshot = read_snapshot(&self.path).await?;
        match snapshot.get_mut(&key.render()) {
            Some(record) if record.blob_id == blob_id && !record.replicated => {
                record.replicated = true;
            }
            _ => return Ok(false),
        }
        write_snapshot(&self.path, &snapshot).await?;
        Ok(true)
    }
}

async fn read_snapshot(path: &Path) -> Result<Snapshot, LocalTierError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::new()),
        Err(err) => return Err(err.into()),
    };
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Snapshot::new());
    }

    let raw: BTreeMap<String, StoredValue> = serde_json::from_slice(&bytes)?;
    Ok(raw
        .into_iter()
        .map(|(key, value)| (key, LocalRecord::from(value)))
        .collect())
}

async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<(), LocalTierError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "metadata-cache.json".to_string());
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, ulid::Ulid::new()));

    tokio::fs::write(&tmp_path, &bytes).await?;
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}
