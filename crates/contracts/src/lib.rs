use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod canonical;
mod index;

pub use index::{IndexDocument, IndexKind, ItemMetadata, ItemUpdate};

pub const MAX_PRINCIPAL_ID_LEN: usize = 256;
pub const MAX_BLOB_ID_LEN: usize = 256;

pub fn unix_epoch_ms_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration.as_millis().min(i64::MAX as u128) as i64
}

/// What a registry entry points at. The purpose is carried as a literal tag on
/// the value written to the ledger, never on the key, so a single
/// principal-keyed event stream can hold every purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    ChatIndex,
    DocumentIndex,
    RegistryPointer,
}

impl Purpose {
    pub const ALL: [Purpose; 3] = [
        Purpose::ChatIndex,
        Purpose::DocumentIndex,
        Purpose::RegistryPointer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Purpose::ChatIndex => "chat_index",
            Purpose::DocumentIndex => "document_index",
            Purpose::RegistryPointer => "registry_pointer",
        }
    }

    pub fn ledger_tag(self) -> &'static str {
        match self {
            Purpose::ChatIndex => "chat:",
            Purpose::DocumentIndex => "docs:",
            Purpose::RegistryPointer => "registry:",
        }
    }

    pub fn tag_value(self, blob_id: &str) -> String {
        format!("{}{}", self.ledger_tag(), blob_id)
    }

    /// Returns the blob ID carried by a tagged ledger value, or `None` when the
    /// value belongs to another purpose or carries no usable blob ID.
    pub fn strip_tag(self, value: &str) -> Option<&str> {
        let blob_id = value.strip_prefix(self.ledger_tag())?;
        validate_blob_id(blob_id).ok()?;
        Some(blob_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedKey {
    pub principal_id: String,
    pub purpose: Purpose,
}

impl NamespacedKey {
    pub fn new(principal_id: &str, purpose: Purpose) -> Self {
        Self {
            principal_id: principal_id.trim().to_string(),
            purpose,
        }
    }

    pub fn chat_index(principal_id: &str) -> Self {
        Self::new(principal_id, Purpose::ChatIndex)
    }

    pub fn document_index(principal_id: &str) -> Self {
        Self::new(principal_id, Purpose::DocumentIndex)
    }

    pub fn registry_pointer(principal_id: &str) -> Self {
        Self::new(principal_id, Purpose::RegistryPointer)
    }

    /// Key under which the host-local tier stores the entry.
    pub fn render(&self) -> String {
        format!("{}/{}", self.purpose.as_str(), self.principal_id)
    }

    pub fn parse_rendered(rendered: &str) -> Option<Self> {
        let (space, principal_id) = rendered.split_once('/')?;
        let purpose = Purpose::ALL.into_iter().find(|p| p.as_str() == space)?;
        let key = Self::new(principal_id, purpose);
        key.validate().ok()?;
        Some(key)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        validate_principal_id(&self.principal_id)
    }
}

impl std::fmt::Display for NamespacedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

pub fn validate_principal_id(principal_id: &str) -> Result<(), &'static str> {
    if principal_id.trim().is_empty() {
        return Err("principal_id is required");
    }
    if principal_id.len() > MAX_PRINCIPAL_ID_LEN {
        return Err("principal_id too long");
    }
    if principal_id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '/')
    {
        return Err("principal_id contains invalid characters");
    }
    Ok(())
}

pub fn validate_blob_id(blob_id: &str) -> Result<(), &'static str> {
    if blob_id.is_empty() {
        return Err("blob_id is required");
    }
    if blob_id.len() > MAX_BLOB_ID_LEN {
        return Err("blob_id too long");
    }
    if blob_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("blob_id contains invalid characters");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataTier {
    Memory,
    DurableLocal,
    Ledger,
}

impl MetadataTier {
    pub fn as_str(self) -> &'static str {
        match self {
            MetadataTier::Memory => "memory",
            MetadataTier::DurableLocal => "durable_local",
            MetadataTier::Ledger => "ledger",
        }
    }
}

/// A resolved key. `tier` records where the value was found and has no
/// bearing on correctness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: NamespacedKey,
    pub blob_id: String,
    pub tier: MetadataTier,
    pub observed_at_epoch_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub resource_id: String,
    pub owner: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub allowed_principals: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub content_ref: String,
    pub resource_id: String,
    #[serde(default)]
    pub owner_hint: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub relevance_score: f64,
    #[serde(default)]
    pub preview_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCitation {
    pub content_ref: String,
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub relevance_score: f64,
}

impl From<&SourceCandidate> for SourceCitation {
    fn from(candidate: &SourceCandidate) -> Self {
        Self {
            content_ref: candidate.content_ref.clone(),
            resource_id: candidate.resource_id.clone(),
            title: candidate.title.clone(),
            relevance_score: candidate.relevance_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryOutcome {
    Answered {
        answer: String,
        sources: Vec<SourceCitation>,
        candidate_count: usize,
        denied_count: usize,
        unavailable_count: usize,
    },
    NoAccessibleSources {
        candidate_count: usize,
        denied_count: usize,
        unavailable_count: usize,
    },
}

impl QueryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::Answered { .. } => "ANSWERED",
            QueryOutcome::NoAccessibleSources { .. } => "NO_ACCESSIBLE_SOURCES",
        }
    }

    pub fn denied_count(&self) -> usize {
        match self {
            QueryOutcome::Answered { denied_count, .. }
            | QueryOutcome::NoAccessibleSources { denied_count, .. } => *denied_count,
        }
    }
}
