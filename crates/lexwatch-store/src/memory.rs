//! In-memory store behind a single `parking_lot::RwLock`.
//!
//! Each trait call takes the lock once, so a batch is either fully visible
//! or not at all, and the dedup check-then-insert cannot interleave.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use lexwatch_core::{
    Alert, AlertId, ChangeRecord, DedupKey, DeliveryRecord, OperationOutcome, Regulation, Rule,
    SourceOperationLog,
};
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    AlertStore, OperationLogStore, ReconcileBatch, RegulationSnapshot, RuleStore, StoreError,
};

#[derive(Default)]
struct State {
    regulations: HashMap<String, RegulationSnapshot>,
    history: HashMap<String, Vec<ChangeRecord>>,
    alerts: Vec<Alert>,
    alert_index: HashMap<AlertId, usize>,
    /// Dedup keys of unresolved alerts.
    open_keys: HashMap<DedupKey, AlertId>,
    deliveries: Vec<DeliveryRecord>,
    logs: HashMap<String, Vec<SourceOperationLog>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regulations stored.
    pub fn regulation_count(&self) -> usize {
        self.state.read().regulations.len()
    }
}

// ── Rules ──

impl RuleStore for MemoryStore {
    fn regulation(&self, key: &str) -> Result<Option<RegulationSnapshot>, StoreError> {
        Ok(self.state.read().regulations.get(key).cloned())
    }

    fn apply(&self, batch: ReconcileBatch) -> Result<Regulation, StoreError> {
        let mut state = self.state.write();
        let key = batch.regulation.key.clone();

        let current = state.regulations.get(&key);
        let actual = current.map(RegulationSnapshot::revision);
        if actual != batch.expected_revision {
            return Err(StoreError::Conflict {
                key,
                expected: batch.expected_revision,
                actual,
            });
        }

        // Validate everything before touching state.
        let mut rules: BTreeMap<String, Rule> =
            current.map(|s| s.rules.clone()).unwrap_or_default();
        for rule in &batch.rules {
            if rule.regulation_id != batch.regulation.id {
                return Err(StoreError::Other(format!(
                    "rule {} belongs to another regulation",
                    rule.section_code
                )));
            }
            if let Some(existing) = rules.get(&rule.section_code)
                && existing.id != rule.id
            {
                return Err(StoreError::Other(format!(
                    "section {} already stored under another rule id",
                    rule.section_code
                )));
            }
        }
        if let Some(current) = current
            && current.regulation.id != batch.regulation.id
        {
            return Err(StoreError::Other(format!(
                "regulation {key} already stored under another id"
            )));
        }

        let written = batch.rules.len();
        for rule in batch.rules {
            rules.insert(rule.section_code.clone(), rule);
        }
        let mut regulation = batch.regulation;
        regulation.revision = actual.map_or(1, |r| r + 1);

        state.regulations.insert(
            key.clone(),
            RegulationSnapshot {
                regulation: regulation.clone(),
                rules,
            },
        );
        state
            .history
            .entry(key.clone())
            .or_default()
            .extend(batch.changes);

        debug!(key = %key, revision = regulation.revision, rules = written, "applied batch");
        Ok(regulation)
    }

    fn change_history(&self, key: &str) -> Result<Vec<ChangeRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .history
            .get(key)
            .cloned()
            .unwrap_or_default())
    }
}

// ── Alerts ──

impl AlertStore for MemoryStore {
    fn insert_if_absent(&self, alert: Alert) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        if state.open_keys.contains_key(&alert.dedup_key) {
            return Ok(false);
        }
        if state.alert_index.contains_key(&alert.id) {
            return Err(StoreError::Other(format!("alert {} already stored", alert.id)));
        }
        let idx = state.alerts.len();
        state.alert_index.insert(alert.id, idx);
        if !alert.is_resolved() {
            state.open_keys.insert(alert.dedup_key.clone(), alert.id);
        }
        state.alerts.push(alert);
        Ok(true)
    }

    fn resolve(&self, id: AlertId, at: DateTime<Utc>) -> Result<Alert, StoreError> {
        let mut state = self.state.write();
        let idx = *state
            .alert_index
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {id}")))?;
        let alert = &mut state.alerts[idx];
        if alert.resolved_at.is_none() {
            alert.resolved_at = Some(at);
        }
        let alert = alert.clone();
        if state.open_keys.get(&alert.dedup_key) == Some(&id) {
            state.open_keys.remove(&alert.dedup_key);
        }
        Ok(alert)
    }

    fn alert(&self, id: AlertId) -> Result<Option<Alert>, StoreError> {
        let state = self.state.read();
        Ok(state.alert_index.get(&id).map(|&i| state.alerts[i].clone()))
    }

    fn alerts(&self) -> Result<Vec<Alert>, StoreError> {
        Ok(self.state.read().alerts.clone())
    }

    fn record_delivery(&self, record: DeliveryRecord) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.alert_index.contains_key(&record.alert_id) {
            return Err(StoreError::NotFound(format!("alert {}", record.alert_id)));
        }
        state.deliveries.push(record);
        Ok(())
    }

    fn deliveries(&self, alert_id: AlertId) -> Result<Vec<DeliveryRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .deliveries
            .iter()
            .filter(|d| d.alert_id == alert_id)
            .cloned()
            .collect())
    }
}

// ── Operation log ──

impl OperationLogStore for MemoryStore {
    fn append_log(&self, entry: SourceOperationLog) -> Result<(), StoreError> {
        self.state
            .write()
            .logs
            .entry(entry.source_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    fn logs(&self, source_id: &str) -> Result<Vec<SourceOperationLog>, StoreError> {
        Ok(self
            .state
            .read()
            .logs
            .get(source_id)
            .cloned()
            .unwrap_or_default())
    }

    fn last_success(&self, source_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state.read().logs.get(source_id).and_then(|entries| {
            entries
                .iter()
                .filter(|e| e.outcome == OperationOutcome::Success)
                .map(|e| e.finished_at)
                .max()
        }))
    }
}
