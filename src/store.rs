use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::normalizer::{apply_patch, format_age, merge_record, synthesize};
use crate::types::{DisplayRecord, RecordPatch};

/// Input to [`RecordStore::upsert`].
#[derive(Debug, Clone)]
pub enum Upsert {
    /// A fully normalized record from a new-signal frame.
    Record(DisplayRecord),
    /// A partial update.
    Patch(RecordPatch),
}

/// What an upsert did to the store.
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    Inserted(DisplayRecord),
    Merged(DisplayRecord),
    /// The record was inserted but fell off the tail during truncation.
    Evicted,
}

/// Bounded set of display records keyed by token id, newest token first.
pub struct RecordStore {
    records: Vec<DisplayRecord>,
    max_records: usize,
    snapshot: OnceLock<Arc<[DisplayRecord]>>,
}

impl RecordStore {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Vec::with_capacity(max_records),
            max_records: max_records.max(1),
            snapshot: OnceLock::new(),
        }
    }

    pub fn max_records(&self) -> usize {
        self.max_records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&DisplayRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    /// Insert a record for an unseen id, or merge into the stored one.
    ///
    /// The store is re-sorted and truncated to `max_records` afterwards, dropping
    /// the oldest tokens first.
    pub fn upsert(&mut self, id: &str, input: Upsert, now: DateTime<Utc>) -> UpsertOutcome {
        let inserted = match self.position(id) {
            Some(idx) => {
                let existing = &mut self.records[idx];
                match &input {
                    Upsert::Record(record) => merge_record(existing, record, now),
                    Upsert::Patch(patch) => apply_patch(existing, patch, now),
                }
                false
            }
            None => {
                let mut record = match input {
                    Upsert::Record(record) => record,
                    Upsert::Patch(patch) => synthesize(id, &patch, now),
                };
                record.id = id.to_string();
                record.received_at = now;
                record.last_updated_at = now;
                self.records.insert(0, record);
                true
            }
        };

        self.sort_and_truncate();

        match self.get(id) {
            Some(record) if inserted => UpsertOutcome::Inserted(record.clone()),
            Some(record) => UpsertOutcome::Merged(record.clone()),
            None => {
                debug!(id, "record evicted by store bound");
                UpsertOutcome::Evicted
            }
        }
    }

    /// Recompute every age string and re-sort.
    ///
    /// Returns `false` without touching anything when no record has a known
    /// creation time.
    pub fn refresh_ages(&mut self, now_epoch: i64) -> bool {
        if !self.records.iter().any(|r| r.created_at_epoch > 0) {
            return false;
        }
        for record in &mut self.records {
            record.token_age = format_age(record.created_at_epoch, now_epoch);
        }
        self.sort_and_truncate();
        true
    }

    /// Current records in display order. The same `Arc` is returned until the
    /// store next changes.
    pub fn snapshot(&self) -> Arc<[DisplayRecord]> {
        self.snapshot
            .get_or_init(|| Arc::from(self.records.as_slice()))
            .clone()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.snapshot = OnceLock::new();
    }

    fn sort_and_truncate(&mut self) {
        // Stable: among equal creation times the most recently inserted stays first.
        self.records
            .sort_by(|a, b| b.created_at_epoch.cmp(&a.created_at_epoch));
        self.records.truncate(self.max_records);
        self.snapshot = OnceLock::new();
    }
}
