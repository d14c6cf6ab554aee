//! Merge-engine contract and the yrs-backed clinical record engine.
//!
//! The sync layer never looks inside a document. It only needs to merge
//! opaque change bytes, take a full snapshot and restore from one. Snapshots
//! are themselves mergeable, which is what lets a server pull merge instead
//! of overwrite.

use yrs::updates::decoder::Decode;
use yrs::{
    Any, Array, Doc, GetString, Map, Out, ReadTxn, StateVector, Text, Transact, Update, WriteTxn,
};

/// Contract the Document Store relies on.
///
/// `merge` must be idempotent: merging bytes that are already part of the
/// state leaves the state unchanged.
pub trait MergeEngine: Default + Send + 'static {
    /// Merge a remote change (or a full snapshot) into the current state.
    fn merge(&mut self, change: &[u8]) -> Result<(), EngineError>;

    /// Encode the full current state.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the current state with a decoded snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<(), EngineError>;
}

/// Merge engine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("undecodable change: {0}")]
    Decode(String),
    #[error("change could not be applied: {0}")]
    Apply(String),
}

const FIELDS: &str = "fields";
const NOTES: &str = "notes";
const VISITS: &str = "visits";

/// One clinical record as a yrs document.
///
/// Layout:
/// - `fields` map: demographics (`name`, `dob`, …), last writer wins per key
/// - `notes` text: prescription notes, concurrent inserts interleave
/// - `visits` array: visit entries, append-only
pub struct RecordEngine {
    doc: Doc,
}

impl Default for RecordEngine {
    fn default() -> Self {
        Self { doc: Doc::new() }
    }
}

impl RecordEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a demographic field. Returns the change to broadcast.
    pub fn set_field(&mut self, key: &str, value: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let fields = txn.get_or_insert_map(FIELDS);
        fields.insert(&mut txn, key, value);
        txn.encode_update_v1()
    }

    pub fn field(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        let fields = txn.get_map(FIELDS)?;
        match fields.get(&txn, key)? {
            Out::Any(Any::String(s)) => Some(s.to_string()),
            _ => None,
        }
    }

    /// Append text to the prescription notes.
    pub fn append_note(&mut self, text: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let notes = txn.get_or_insert_text(NOTES);
        let len = notes.len(&txn);
        notes.insert(&mut txn, len, text);
        txn.encode_update_v1()
    }

    pub fn notes(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(NOTES)
            .map(|notes| notes.get_string(&txn))
            .unwrap_or_default()
    }

    /// Record a visit entry (free-form, usually a JSON line).
    pub fn add_visit(&mut self, entry: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let visits = txn.get_or_insert_array(VISITS);
        visits.push_back(&mut txn, entry);
        txn.encode_update_v1()
    }

    pub fn visits(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let Some(visits) = txn.get_array(VISITS) else {
            return Vec::new();
        };
        visits
            .iter(&txn)
            .filter_map(|value| match value {
                Out::Any(Any::String(s)) => Some(s.to_string()),
                _ => None,
            })
            .collect()
    }
}

impl MergeEngine for RecordEngine {
    fn merge(&mut self, change: &[u8]) -> Result<(), EngineError> {
        let update = Update::decode_v1(change).map_err(|e| EngineError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| EngineError::Apply(e.to_string()))
    }

    fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), EngineError> {
        let update =
            Update::decode_v1(snapshot).map_err(|e| EngineError::Decode(e.to_string()))?;
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| EngineError::Apply(e.to_string()))?;
        }
        self.doc = doc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_change_replicates() {
        let mut a = RecordEngine::new();
        let mut b = RecordEngine::new();

        let change = a.set_field("name", "Amina Otieno");
        b.merge(&change).unwrap();

        assert_eq!(b.field("name").as_deref(), Some("Amina Otieno"));
        assert_eq!(b.field("dob"), None);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = RecordEngine::new();
        let mut b = RecordEngine::new();
        let change = a.append_note("Amoxicillin 500mg TID. ");

        b.merge(&change).unwrap();
        let once = b.snapshot();
        b.merge(&change).unwrap();
        assert_eq!(b.snapshot(), once);
        assert_eq!(b.notes(), "Amoxicillin 500mg TID. ");
    }

    #[test]
    fn test_concurrent_note_edits_converge() {
        let mut a = RecordEngine::new();
        let mut b = RecordEngine::new();

        let from_a = a.append_note("[A] review in 2 weeks.");
        let from_b = b.append_note("[B] allergic to penicillin.");

        a.merge(&from_b).unwrap();
        b.merge(&from_a).unwrap();

        assert_eq!(a.notes(), b.notes());
        assert!(a.notes().contains("[A] review in 2 weeks."));
        assert!(a.notes().contains("[B] allergic to penicillin."));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut a = RecordEngine::new();
        a.set_field("name", "Baraka");
        a.add_visit(r#"{"date":"2026-03-01","reason":"checkup"}"#);
        a.add_visit(r#"{"date":"2026-04-12","reason":"follow-up"}"#);

        let mut restored = RecordEngine::new();
        restored.restore(&a.snapshot()).unwrap();
        assert_eq!(restored.field("name").as_deref(), Some("Baraka"));
        assert_eq!(restored.visits().len(), 2);
    }

    #[test]
    fn test_snapshot_merges_without_losing_local_edits() {
        let mut server = RecordEngine::new();
        server.set_field("name", "Chebet");

        let mut local = RecordEngine::new();
        local.append_note("local only");
        local.merge(&server.snapshot()).unwrap();

        assert_eq!(local.field("name").as_deref(), Some("Chebet"));
        assert_eq!(local.notes(), "local only");
    }

    #[test]
    fn test_malformed_change_is_rejected() {
        let mut engine = RecordEngine::new();
        engine.set_field("name", "Dalia");
        let before = engine.snapshot();

        assert!(engine.merge(&[0xFF, 0xFE, 0xFD, 0xFC]).is_err());
        assert!(engine.restore(&[0xFF, 0x00, 0x13]).is_err());
        assert_eq!(engine.snapshot(), before);
    }

    #[test]
    fn test_empty_document_reads() {
        let engine = RecordEngine::new();
        assert_eq!(engine.notes(), "");
        assert!(engine.visits().is_empty());
        assert_eq!(engine.field("name"), None);
    }
}
