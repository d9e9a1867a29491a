use serde::{Deserialize, Serialize};

use crate::Purpose;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Chat,
    Document,
}

impl IndexKind {
    pub fn purpose(self) -> Purpose {
        match self {
            IndexKind::Chat => Purpose::ChatIndex,
            IndexKind::Document => Purpose::DocumentIndex,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Chat => "chat",
            IndexKind::Document => "document",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub item_id: String,
    #[serde(alias = "filename")]
    pub title: String,
    pub created_at: i64,
    pub last_activity: i64,
    pub content_blob_id: String,
    pub blob_expires_at: i64,
    #[serde(default)]
    pub current_lease_period: u32,
    #[serde(default, alias = "is_starred")]
    pub is_important: bool,
    pub owner: String,
}

/// Field-level changes applied by `update_item`; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_activity: Option<i64>,
    #[serde(default)]
    pub content_blob_id: Option<String>,
    #[serde(default)]
    pub blob_expires_at: Option<i64>,
    #[serde(default)]
    pub current_lease_period: Option<u32>,
    #[serde(default)]
    pub is_important: Option<bool>,
}

impl ItemUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ItemUpdate::default()
    }

    pub fn apply(&self, item: &mut ItemMetadata) {
        if let Some(title) = &self.title {
            item.title = title.clone();
        }
        if let Some(last_activity) = self.last_activity {
            item.last_activity = last_activity;
        }
        if let Some(content_blob_id) = &self.content_blob_id {
            item.content_blob_id = content_blob_id.clone();
        }
        if let Some(blob_expires_at) = self.blob_expires_at {
            item.blob_expires_at = blob_expires_at;
        }
        if let Some(current_lease_period) = self.current_lease_period {
            item.current_lease_period = current_lease_period;
        }
        if let Some(is_important) = self.is_important {
            item.is_important = is_important;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub principal_id: String,
    pub kind: IndexKind,
    #[serde(default)]
    pub items: Vec<ItemMetadata>,
    #[serde(default)]
    pub last_updated: i64,
}

impl IndexDocument {
    pub fn empty(principal_id: &str, kind: IndexKind) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            kind,
            items: Vec::new(),
            last_updated: 0,
        }
    }

    pub fn get(&self, item_id: &str) -> Option<&ItemMetadata> {
        self.items.iter().find(|item| item.item_id == item_id)
    }

    /// Replaces an existing item in place, otherwise inserts at the front.
    pub fn upsert(&mut self, item: ItemMetadata) {
        match self.items.iter_mut().find(|i| i.item_id == item.item_id) {
            Some(existing) => *existing = item,
            None => self.items.insert(0, item),
        }
    }

    pub fn update(&mut self, item_id: &str, update: &ItemUpdate) -> Option<&ItemMetadata> {
        let item = self.items.iter_mut().find(|i| i.item_id == item_id)?;
        update.apply(item);
        Some(item)
    }

    pub fn remove(&mut self, item_id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.item_id != item_id);
        self.items.len() != before
    }

    /// Collapses duplicate item IDs that may exist in documents written by
    /// older clients, keeping the first occurrence.
    pub fn dedup_items(&mut self) -> usize {
        let mut seen = std::collections::HashSet::new();
        let before = self.items.len();
        self.items.retain(|item| seen.insert(item.item_id.clone()));
        before - self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(item_id: &str, title: &str) -> ItemMetadata {
        ItemMetadata {
            item_id: item_id.to_string(),
            title: title.to_string(),
            created_at: 1_000,
            last_activity: 2_000,
            content_blob_id: format!("blob-{item_id}"),
            blob_expires_at: 10_000,
            current_lease_period: 30,
            is_important: false,
            owner: "0xowner".to_string(),
        }
    }

    #[test]
    fn upsert_inserts_new_items_first_and_replaces_existing_in_place() {
        let mut doc = IndexDocument::empty("0xowner", IndexKind::Chat);
        doc.upsert(item("a", "first"));
        doc.upsert(item("b", "second"));
        assert_eq!(doc.items[0].item_id, "b");
        assert_eq!(doc.items[1].item_id, "a");

        doc.upsert(item("a", "renamed"));
        assert_eq!(doc.items.len(), 2);
        assert_eq!(doc.items[1].item_id, "a");
        assert_eq!(doc.items[1].title, "renamed");
    }

    #[test]
    fn update_touches_only_provided_fields() {
        let mut doc = IndexDocument::empty("0xowner", IndexKind::Document);
        doc.upsert(item("a", "report.pdf"));

        let updated = doc
            .update(
                "a",
                &ItemUpdate {
                    content_blob_id: Some("blob-new".to_string()),
                    is_important: Some(true),
                    ..ItemUpdate::default()
                },
            )
            .cloned()
            .expect("item should exist");

        assert_eq!(updated.content_blob_id, "blob-new");
        assert!(updated.is_important);
        assert_eq!(updated.title, "report.pdf");
        assert!(doc.update("missing", &ItemUpdate::default()).is_none());
    }

    #[test]
    fn remove_reports_whether_an_item_was_dropped() {
        let mut doc = IndexDocument::empty("0xowner", IndexKind::Chat);
        doc.upsert(item("a", "x"));
        assert!(doc.remove("a"));
        assert!(!doc.remove("a"));
        assert!(doc.items.is_empty());
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let doc: IndexDocument = serde_json::from_value(serde_json::json!({
            "principal_id": "0xowner",
            "kind": "document",
            "items": [{
                "item_id": "d1",
                "filename": "notes.docx",
                "created_at": 1,
                "last_activity": 2,
                "content_blob_id": "blob-d1",
                "blob_expires_at": 3,
                "is_starred": true,
                "owner": "0xowner"
            }]
        }))
        .expect("legacy document should parse");

        let item = doc.get("d1").expect("item should exist");
        assert_eq!(item.title, "notes.docx");
        assert!(item.is_important);
        assert_eq!(item.current_lease_period, 0);
        assert_eq!(doc.last_updated, 0);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut doc = IndexDocument::empty("0xowner", IndexKind::Chat);
        doc.items = vec![item("a", "new"), item("b", "b"), item("a", "old")];
        assert_eq!(doc.dedup_items(), 1);
        assert_eq!(doc.items.len(), 2);
        assert_eq!(doc.get("a").map(|i| i.title.as_str()), Some("new"));
    }
}
