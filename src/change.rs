//! Change batch and record types.
//!
//! One delivery unit from a change feed is a [`ChangeBatch`]: a sequence
//! of [`ChangeRecord`]s in source order. Each record carries the old and
//! new value of the changed document as JSON:
//!
//! | `old_val` | `new_val` | Meaning  |
//! |-----------|-----------|----------|
//! | absent    | present   | creation |
//! | present   | present   | update   |
//! | present   | absent    | deletion |

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of change a record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A document came into existence (initial value or insert).
    Creation,

    /// An existing document changed.
    Update,

    /// A document was removed.
    Deletion,
}

/// A single change to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The document's previous value; `None` for creations.
    pub old_val: Option<Value>,

    /// The document's new value; `None` for deletions.
    pub new_val: Option<Value>,
}

impl ChangeRecord {
    /// Creates a creation record (no previous value).
    #[must_use]
    pub fn creation(new_val: Value) -> Self {
        Self {
            old_val: None,
            new_val: Some(new_val),
        }
    }

    /// Creates an update record (previous and new value).
    #[must_use]
    pub fn update(old_val: Value, new_val: Value) -> Self {
        Self {
            old_val: Some(old_val),
            new_val: Some(new_val),
        }
    }

    /// Creates a deletion record (no new value).
    #[must_use]
    pub fn deletion(old_val: Value) -> Self {
        Self {
            old_val: Some(old_val),
            new_val: None,
        }
    }

    /// Classifies this record, or `None` if both values are absent.
    #[must_use]
    pub fn kind(&self) -> Option<ChangeKind> {
        match (&self.old_val, &self.new_val) {
            (None, Some(_)) => Some(ChangeKind::Creation),
            (Some(_), Some(_)) => Some(ChangeKind::Update),
            (Some(_), None) => Some(ChangeKind::Deletion),
            (None, None) => None,
        }
    }

    /// Returns `true` if this record represents a creation.
    #[must_use]
    pub fn is_creation(&self) -> bool {
        self.kind() == Some(ChangeKind::Creation)
    }

    /// Returns `true` if this record represents an update.
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.kind() == Some(ChangeKind::Update)
    }

    /// Returns `true` if this record represents a deletion.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.kind() == Some(ChangeKind::Deletion)
    }
}

/// One delivery unit from a change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// The change records, in the order the source produced them.
    pub changes: Vec<ChangeRecord>,
}

impl ChangeBatch {
    /// Creates a batch from a list of records.
    #[must_use]
    pub fn new(changes: Vec<ChangeRecord>) -> Self {
        Self { changes }
    }

    /// Creates an empty batch.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the number of records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns `true` if the batch contains no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterates over the records in source order.
    pub fn iter(&self) -> std::slice::Iter<'_, ChangeRecord> {
        self.changes.iter()
    }
}

impl From<Vec<ChangeRecord>> for ChangeBatch {
    fn from(changes: Vec<ChangeRecord>) -> Self {
        Self::new(changes)
    }
}

impl IntoIterator for ChangeBatch {
    type Item = ChangeRecord;
    type IntoIter = std::vec::IntoIter<ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_classification() {
        let created = ChangeRecord::creation(json!({"id": 1}));
        assert!(created.is_creation());
        assert!(!created.is_update());
        assert!(!created.is_deletion());

        let updated = ChangeRecord::update(json!({"id": 1}), json!({"id": 2}));
        assert!(updated.is_update());

        let deleted = ChangeRecord::deletion(json!({"id": 2}));
        assert!(deleted.is_deletion());
    }

    #[test]
    fn test_record_both_absent_has_no_kind() {
        let record = ChangeRecord {
            old_val: None,
            new_val: None,
        };
        assert_eq!(record.kind(), None);
        assert!(!record.is_creation());
    }

    #[test]
    fn test_batch_basics() {
        let batch = ChangeBatch::new(vec![
            ChangeRecord::creation(json!({"id": 1})),
            ChangeRecord::deletion(json!({"id": 1})),
        ]);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert!(ChangeBatch::empty().is_empty());
    }

    #[test]
    fn test_batch_preserves_order() {
        let batch: ChangeBatch = (0..5)
            .map(|i| ChangeRecord::creation(json!({ "id": i })))
            .collect::<Vec<_>>()
            .into();

        let ids: Vec<i64> = batch
            .iter()
            .map(|r| r.new_val.as_ref().unwrap()["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_batch_serde() {
        let batch = ChangeBatch::new(vec![ChangeRecord::update(
            json!({"id": 1, "name": "old"}),
            json!({"id": 1, "name": "new"}),
        )]);

        let encoded = serde_json::to_string(&batch).unwrap();
        let decoded: ChangeBatch = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }
}
