//! Applies a parsed snapshot to the rule store, one regulation at a time.
//!
//! Reconciliations for the same document key are serialised by an async
//! lock; the store's revision check catches writers outside this engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lexwatch_core::{
    ChangeRecord, ChangeType, ParsedDocument, RawSnapshot, Regulation, RegulationId,
    RegulationStatus, RiskLevel, Rule, RuleId,
};
use lexwatch_diff::DiffClassifier;
use lexwatch_store::{ReconcileBatch, RuleStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::dispatch::AlertRequest;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The regulation changed underneath us twice in a row.
    #[error("reconciliation conflict on {key}")]
    Conflict { key: String },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { key, .. } => Self::Conflict { key },
            other => Self::Store(other),
        }
    }
}

/// What one committed reconciliation changed.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub regulation: Regulation,
    /// Every non-`none` record, in document order.
    pub changes: Vec<ChangeRecord>,
    /// Alerts to raise for updated rules.
    pub alerts: Vec<AlertRequest>,
    /// Sections dropped because classification failed.
    pub skipped: usize,
}

impl ReconcileOutcome {
    pub fn count(&self, change_type: ChangeType) -> usize {
        self.changes
            .iter()
            .filter(|c| c.change_type == change_type)
            .count()
    }
}

pub struct ReconciliationEngine {
    store: Arc<dyn RuleStore>,
    classifier: DiffClassifier,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn RuleStore>, classifier: DiffClassifier) -> Self {
        Self {
            store,
            classifier,
            locks: DashMap::new(),
        }
    }

    pub fn classifier(&self) -> &DiffClassifier {
        &self.classifier
    }

    /// Classify every section of `parsed` against the stored rules and commit
    /// the result atomically. A revision conflict is retried once from a
    /// fresh read.
    pub async fn reconcile(
        &self,
        snapshot: &RawSnapshot,
        parsed: &ParsedDocument,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let key = snapshot.document_key.as_str();
        let lock = Arc::clone(&self.locks.entry(key.to_string()).or_default());
        let _guard = lock.lock().await;

        match self.attempt(snapshot, parsed) {
            Err(ReconcileError::Conflict { .. }) => {
                warn!(document_key = key, "revision conflict, re-reading and retrying once");
                self.attempt(snapshot, parsed)
            }
            other => other,
        }
    }

    fn attempt(
        &self,
        snapshot: &RawSnapshot,
        parsed: &ParsedDocument,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let key = snapshot.document_key.as_str();
        let current = self.store.regulation(key)?;
        let at = snapshot.fetched_at;

        let (expected_revision, regulation, stored) = match current {
            Some(snap) => {
                let revision = snap.revision();
                let mut regulation = snap.regulation;
                regulation.name = snapshot.title.clone();
                regulation.version = snapshot.version_label.clone();
                regulation.source_url = snapshot.document_url.clone();
                regulation.last_updated = at;
                (Some(revision), regulation, snap.rules)
            }
            None => (
                None,
                new_regulation(snapshot, at),
                Default::default(),
            ),
        };

        let mut plan = Plan::default();
        for node in parsed.tree.nodes() {
            let existing = stored.get(&node.code);
            let record = match self.classifier.classify(
                &node.code,
                existing.map(|r| r.content.as_str()),
                &node.text,
                at,
            ) {
                Ok(record) => record,
                Err(e) => {
                    warn!(document_key = key, section = %node.code, "skipping section: {e}");
                    plan.skipped += 1;
                    continue;
                }
            };

            match (record.change_type, existing) {
                (ChangeType::Unchanged, _) => continue,
                (ChangeType::New, _) | (_, None) => {
                    plan.rules.push(Rule {
                        id: RuleId::new(),
                        regulation_id: regulation.id,
                        section_code: node.code.clone(),
                        parent_code: node.parent_code.clone(),
                        title: node.title.clone(),
                        content: node.text.clone(),
                        content_hash: record.new_hash.clone(),
                        risk_level: RiskLevel::Medium,
                        version: snapshot.version_label.clone(),
                        last_changed_at: at,
                    });
                }
                (change_type, Some(rule)) => {
                    let mut rule = rule.clone();
                    rule.title = node.title.clone();
                    rule.content = node.text.clone();
                    rule.content_hash = record.new_hash.clone();
                    rule.version = snapshot.version_label.clone();
                    rule.last_changed_at = at;
                    debug!(document_key = key, section = %node.code, %change_type, "rule updated");
                    plan.alerts.push(AlertRequest {
                        rule_id: rule.id,
                        section_code: rule.section_code.clone(),
                        regulation: regulation.name.clone(),
                        change_type,
                        severity_score: record.severity_score,
                        keywords_affected: record.keywords_affected.clone(),
                    });
                    plan.rules.push(rule);
                }
            }
            plan.changes.push(record);
        }

        // Re-processing an unchanged snapshot must not write anything.
        if expected_revision.is_some() && plan.rules.is_empty() {
            return Ok(plan.into_outcome(regulation));
        }

        let batch = ReconcileBatch {
            expected_revision,
            regulation,
            rules: plan.rules.clone(),
            changes: plan.changes.clone(),
        };
        let regulation = self.store.apply(batch)?;
        info!(
            document_key = key,
            revision = regulation.revision,
            changes = plan.changes.len(),
            "regulation reconciled"
        );
        Ok(plan.into_outcome(regulation))
    }
}

fn new_regulation(snapshot: &RawSnapshot, at: DateTime<Utc>) -> Regulation {
    Regulation {
        id: RegulationId::new(),
        key: snapshot.document_key.clone(),
        name: snapshot.title.clone(),
        version: snapshot.version_label.clone(),
        status: RegulationStatus::Active,
        source_url: snapshot.document_url.clone(),
        last_updated: at,
        revision: 0,
    }
}

#[derive(Default)]
struct Plan {
    rules: Vec<Rule>,
    changes: Vec<ChangeRecord>,
    alerts: Vec<AlertRequest>,
    skipped: usize,
}

impl Plan {
    fn into_outcome(self, regulation: Regulation) -> ReconcileOutcome {
        ReconcileOutcome {
            regulation,
            changes: self.changes,
            alerts: self.alerts,
            skipped: self.skipped,
        }
    }
}
