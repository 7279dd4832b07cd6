//! Storage layer: rules per regulation, alerts with their dedup index, and
//! the source operation log.
//!
//! The traits are synchronous. Callers never hold a store borrow across an
//! await point, so every call is one short critical section.

mod error;
mod memory;

pub use error::StoreError;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lexwatch_core::{
    Alert, AlertId, ChangeRecord, DeliveryRecord, Regulation, Rule, SourceOperationLog,
};

/// A regulation together with its rules, read at one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct RegulationSnapshot {
    pub regulation: Regulation,
    /// Keyed by `section_code`.
    pub rules: BTreeMap<String, Rule>,
}

impl RegulationSnapshot {
    pub fn revision(&self) -> u64 {
        self.regulation.revision
    }
}

/// Everything one reconciliation writes, applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct ReconcileBatch {
    /// Revision the batch was computed against; `None` if the regulation
    /// did not exist yet.
    pub expected_revision: Option<u64>,
    /// New regulation header. Its `revision` is assigned by the store.
    pub regulation: Regulation,
    /// Rules to insert or replace, matched by `section_code`.
    pub rules: Vec<Rule>,
    /// Non-trivial change records for the audit trail.
    pub changes: Vec<ChangeRecord>,
}

pub trait RuleStore: Send + Sync {
    /// Current state of the regulation stored under `key`, if any.
    fn regulation(&self, key: &str) -> Result<Option<RegulationSnapshot>, StoreError>;

    /// Commit a batch if the stored revision still equals
    /// `batch.expected_revision`. Returns the regulation at its new revision.
    fn apply(&self, batch: ReconcileBatch) -> Result<Regulation, StoreError>;

    /// Audit trail of non-`none` change records, oldest first.
    fn change_history(&self, key: &str) -> Result<Vec<ChangeRecord>, StoreError>;
}

pub trait AlertStore: Send + Sync {
    /// Insert `alert` unless an unresolved alert with the same dedup key
    /// exists. Returns whether it was inserted.
    fn insert_if_absent(&self, alert: Alert) -> Result<bool, StoreError>;

    /// Mark an alert resolved, freeing its dedup key.
    fn resolve(&self, id: AlertId, at: DateTime<Utc>) -> Result<Alert, StoreError>;

    fn alert(&self, id: AlertId) -> Result<Option<Alert>, StoreError>;

    /// All alerts in insertion order.
    fn alerts(&self) -> Result<Vec<Alert>, StoreError>;

    fn record_delivery(&self, record: DeliveryRecord) -> Result<(), StoreError>;

    fn deliveries(&self, alert_id: AlertId) -> Result<Vec<DeliveryRecord>, StoreError>;
}

pub trait OperationLogStore: Send + Sync {
    fn append_log(&self, entry: SourceOperationLog) -> Result<(), StoreError>;

    /// Entries for one source, oldest first.
    fn logs(&self, source_id: &str) -> Result<Vec<SourceOperationLog>, StoreError>;

    /// Finish time of the most recent successful fetch.
    fn last_success(&self, source_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
}
