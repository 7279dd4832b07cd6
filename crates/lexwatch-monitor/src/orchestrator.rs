//! Run coordination: one task per source, bounded by a semaphore, fanned in
//! through a `JoinSet` under the run deadline.
//!
//! At the deadline only units that have not written to the store yet are
//! aborted. A unit past its first reconciliation runs to completion; its
//! deliveries are bounded by the same deadline and end up recorded as
//! permanently failed rather than lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use lexwatch_core::{
    MonitorConfig, OperationOutcome, Source, SourceOperationLog, parse_sections,
};
use lexwatch_diff::{ClassificationError, DiffClassifier};
use lexwatch_fetch::{FetchError, FetcherSet, RetryExecutor, RetryPolicy};
use lexwatch_store::{AlertStore, OperationLogStore, RuleStore, StoreError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::dispatch::{AlertDispatcher, DeliveryError, EmitOutcome, MessageBus};
use crate::reconcile::{ReconcileError, ReconciliationEngine};

const DEADLINE_MESSAGE: &str = "run deadline exceeded";

/// Why a source's unit of work failed.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unit panicked: {0}")]
    Panicked(String),
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

/// Errors building an orchestrator.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] lexwatch_core::ConfigError),
    #[error(transparent)]
    Classifier(#[from] ClassificationError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Outcome of one source's unit of work.
#[derive(Debug, Default)]
pub struct RunResult {
    pub source_id: String,
    pub snapshots: usize,
    pub changes_detected: usize,
    pub alerts_emitted: usize,
    pub delivery_failures: usize,
    pub parse_warnings: usize,
    pub skipped_sections: usize,
    /// First error hit by the unit. Later snapshots of a feed are still
    /// processed after a reconciliation error.
    pub error: Option<UnitError>,
}

impl RunResult {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            ..Self::default()
        }
    }

    fn failed(source_id: &str, error: UnitError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(source_id)
        }
    }

    fn record_error(&mut self, error: UnitError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub sources_processed: usize,
    /// Non-`none` change records, including first sightings.
    pub changes_detected: usize,
    pub alerts_emitted: usize,
    pub failures: usize,
    pub delivery_failures: usize,
    pub parse_warnings: usize,
}

impl RunStats {
    fn absorb(&mut self, result: &RunResult) {
        self.sources_processed += 1;
        self.changes_detected += result.changes_detected;
        self.alerts_emitted += result.alerts_emitted;
        self.delivery_failures += result.delivery_failures;
        self.parse_warnings += result.parse_warnings;
        if !result.is_success() {
            self.failures += 1;
        }
    }
}

/// Aggregated stats together with the per-source results.
#[derive(Debug, Default)]
pub struct RunReport {
    pub stats: RunStats,
    pub results: Vec<RunResult>,
}

const GATE_OPEN: u8 = 0;
const GATE_COMMITTED: u8 = 1;
const GATE_CANCELLED: u8 = 2;

/// Decides, once, whether a unit gets to write or the run gives up on it.
#[derive(Debug, Default)]
struct UnitGate(AtomicU8);

impl UnitGate {
    /// Claimed by the unit before its first store write. False if the run
    /// already cancelled it.
    fn commit(&self) -> bool {
        match self.0.compare_exchange(GATE_OPEN, GATE_COMMITTED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(state) => state == GATE_COMMITTED,
        }
    }

    /// Claimed by the run at the deadline. False if the unit is already
    /// writing and must be left to finish.
    fn cancel(&self) -> bool {
        match self.0.compare_exchange(GATE_OPEN, GATE_CANCELLED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(state) => state == GATE_CANCELLED,
        }
    }
}

struct PendingUnit {
    source_id: String,
    gate: Arc<UnitGate>,
    abort: AbortHandle,
}

struct Inner {
    config: MonitorConfig,
    fetchers: FetcherSet,
    retry: RetryExecutor,
    reconciler: ReconciliationEngine,
    dispatcher: Arc<AlertDispatcher>,
    log: Arc<dyn OperationLogStore>,
}

#[derive(Clone)]
pub struct MonitorOrchestrator {
    inner: Arc<Inner>,
}

impl MonitorOrchestrator {
    pub fn new(
        config: MonitorConfig,
        fetchers: FetcherSet,
        rules: Arc<dyn RuleStore>,
        log: Arc<dyn OperationLogStore>,
        dispatcher: Arc<AlertDispatcher>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let classifier = DiffClassifier::new(config.classifier.clone())?;
        Ok(Self {
            inner: Arc::new(Inner {
                retry: RetryExecutor::new(RetryPolicy::from(&config.fetch_retry)),
                reconciler: ReconciliationEngine::new(rules, classifier),
                config,
                fetchers,
                dispatcher,
                log,
            }),
        })
    }

    /// Wire everything from `config` over one store: the standard fetchers and
    /// a dispatcher with the configured sinks.
    pub fn from_config<S>(
        config: MonitorConfig,
        store: Arc<S>,
        bus: Option<Arc<dyn MessageBus>>,
    ) -> Result<Self, SetupError>
    where
        S: RuleStore + AlertStore + OperationLogStore + 'static,
    {
        config.validate()?;
        let fetchers = FetcherSet::standard(&config)?;
        let dispatcher = AlertDispatcher::from_config(store.clone(), &config, bus)?;
        Self::new(config, fetchers, store.clone(), store, Arc::new(dispatcher))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.inner.dispatcher
    }

    /// Process every active source.
    pub async fn run_once(&self, sources: &[Source]) -> RunStats {
        self.run(sources).await.stats
    }

    /// Process the active sources whose poll interval has elapsed since
    /// their last successful fetch.
    pub async fn run_due(&self, sources: &[Source], now: DateTime<Utc>) -> RunStats {
        let due: Vec<Source> = sources
            .iter()
            .filter(|s| s.is_active())
            .filter(|s| match self.inner.log.last_success(s.id()) {
                Ok(last) => s.is_due(last, now),
                Err(e) => {
                    warn!(source_id = s.id(), "cannot read last success, polling: {e}");
                    true
                }
            })
            .cloned()
            .collect();
        info!(due = due.len(), total = sources.len(), "selected due sources");
        self.run_once(&due).await
    }

    /// Run one source's unit of work on demand, whether or not it is active.
    pub async fn check_source(&self, source: &Source) -> RunResult {
        let deadline = Instant::now() + self.inner.config.run_deadline();
        let gate = UnitGate::default();
        let unit = self.inner.process(source, deadline, &gate);
        tokio::pin!(unit);
        tokio::select! {
            result = &mut unit => return result,
            () = tokio::time::sleep_until(deadline) => {}
        }
        if gate.cancel() {
            self.inner.log_deadline(source.id());
            return RunResult::failed(source.id(), UnitError::DeadlineExceeded);
        }
        warn!(source_id = source.id(), "deadline passed after changes were committed, finishing unit");
        unit.await
    }

    /// Process every active source and keep the per-source results.
    pub async fn run(&self, sources: &[Source]) -> RunReport {
        let active: Vec<Source> = sources.iter().filter(|s| s.is_active()).cloned().collect();
        let deadline = Instant::now() + self.inner.config.run_deadline();
        info!(count = active.len(), concurrency = self.inner.config.concurrency, "starting run");

        let permits = Arc::new(Semaphore::new(self.inner.config.concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut pending: HashMap<tokio::task::Id, PendingUnit> = HashMap::new();

        for source in active {
            let inner = Arc::clone(&self.inner);
            let permits = Arc::clone(&permits);
            let gate = Arc::new(UnitGate::default());
            let unit_gate = Arc::clone(&gate);
            let source_id = source.id().to_string();
            let abort = set.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return RunResult::failed(
                        source.id(),
                        UnitError::Panicked("worker pool closed".into()),
                    );
                };
                inner.process(&source, deadline, &unit_gate).await
            });
            pending.insert(
                abort.id(),
                PendingUnit {
                    source_id,
                    gate,
                    abort,
                },
            );
        }

        let mut report = RunReport::default();
        let mut timed_out: Vec<String> = Vec::new();
        let mut expired = false;
        loop {
            let next = if expired {
                set.join_next_with_id().await
            } else {
                match tokio::time::timeout_at(deadline, set.join_next_with_id()).await {
                    Ok(next) => next,
                    Err(_) => {
                        expired = true;
                        let mut finishing = 0;
                        for unit in pending.values() {
                            if unit.gate.cancel() {
                                unit.abort.abort();
                            } else {
                                finishing += 1;
                            }
                        }
                        warn!(
                            pending = pending.len(),
                            finishing,
                            "{DEADLINE_MESSAGE}, aborting units that have not committed"
                        );
                        continue;
                    }
                }
            };
            match next {
                None => break,
                Some(Ok((id, result))) => {
                    pending.remove(&id);
                    report.stats.absorb(&result);
                    report.results.push(result);
                }
                Some(Err(e)) if e.is_cancelled() => {
                    if let Some(unit) = pending.remove(&e.id()) {
                        timed_out.push(unit.source_id);
                    }
                }
                Some(Err(e)) => {
                    let source_id = pending.remove(&e.id()).map(|u| u.source_id).unwrap_or_default();
                    let reason = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        e.to_string()
                    };
                    error!(source_id = %source_id, "unit aborted: {reason}");
                    let result = RunResult::failed(&source_id, UnitError::Panicked(reason));
                    report.stats.absorb(&result);
                    report.results.push(result);
                }
            }
        }

        timed_out.sort();
        for source_id in timed_out {
            self.inner.log_deadline(&source_id);
            let result = RunResult::failed(&source_id, UnitError::DeadlineExceeded);
            report.stats.absorb(&result);
            report.results.push(result);
        }

        let s = &report.stats;
        info!(
            sources = s.sources_processed,
            changes = s.changes_detected,
            alerts = s.alerts_emitted,
            failures = s.failures,
            "run complete"
        );
        report
    }
}

impl Inner {
    /// fetch → parse → reconcile → dispatch, strictly in order.
    async fn process(&self, source: &Source, deadline: Instant, gate: &UnitGate) -> RunResult {
        let mut result = RunResult::new(source.id());

        let fetcher = match self.fetchers.get(source.kind()) {
            Ok(fetcher) => fetcher,
            Err(e) => {
                warn!(source_id = source.id(), "fetch failed: {e}");
                self.log_failure(source.id(), &e.to_string());
                result.error = Some(e.into());
                return result;
            }
        };
        let fetched = self
            .retry
            .fetch_source(fetcher.as_ref(), source, Some(deadline), self.log.as_ref())
            .await;
        let snapshots = match fetched {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(source_id = source.id(), "fetch failed: {e}");
                result.error = Some(e.into());
                return result;
            }
        };
        result.snapshots = snapshots.len();

        if Instant::now() >= deadline || !gate.commit() {
            self.log_deadline(source.id());
            result.error = Some(UnitError::DeadlineExceeded);
            return result;
        }

        let mut all_reconciled = true;
        for snapshot in &snapshots {
            let parsed = parse_sections(&snapshot.full_text);
            for w in &parsed.warnings {
                warn!(source_id = source.id(), document_key = %snapshot.document_key, "parse warning: {w}");
            }
            result.parse_warnings += parsed.warnings.len();

            let outcome = match self.reconciler.reconcile(snapshot, &parsed).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(source_id = source.id(), document_key = %snapshot.document_key, "reconciliation failed: {e}");
                    result.record_error(e.into());
                    all_reconciled = false;
                    continue;
                }
            };
            result.changes_detected += outcome.changes.len();
            result.skipped_sections += outcome.skipped;

            for request in &outcome.alerts {
                match self.dispatcher.emit(request, Some(deadline)).await {
                    Ok(emitted @ EmitOutcome::Emitted { .. }) => {
                        result.alerts_emitted += 1;
                        result.delivery_failures += emitted.failed_deliveries();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(source_id = source.id(), section = %request.section_code, "alert not stored: {e}");
                        result.record_error(e.into());
                    }
                }
            }
        }

        if all_reconciled {
            fetcher.commit(source);
        } else {
            warn!(source_id = source.id(), "fetch not committed, snapshots will be replayed");
        }

        info!(
            source_id = source.id(),
            snapshots = result.snapshots,
            changes = result.changes_detected,
            alerts = result.alerts_emitted,
            "source processed"
        );
        result
    }

    fn log_deadline(&self, source_id: &str) {
        warn!(source_id, "{DEADLINE_MESSAGE}");
        self.log_failure(source_id, DEADLINE_MESSAGE);
    }

    fn log_failure(&self, source_id: &str, detail: &str) {
        let now = Utc::now();
        let entry = SourceOperationLog {
            source_id: source_id.to_string(),
            started_at: now,
            finished_at: now,
            outcome: OperationOutcome::Failure,
            attempt_count: 0,
            error_detail: Some(detail.to_string()),
        };
        if let Err(e) = self.log.append_log(entry) {
            warn!(source_id, "failed to write operation log: {e}");
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use lexwatch_core::{PollFrequency, SourceKind};

    use super::*;

    #[test]
    fn stats_count_failures_once_per_unit() {
        let mut stats = RunStats::default();
        stats.absorb(&RunResult {
            changes_detected: 3,
            alerts_emitted: 1,
            delivery_failures: 1,
            ..RunResult::new("a")
        });
        stats.absorb(&RunResult::failed("b", UnitError::DeadlineExceeded));
        assert_eq!(
            stats,
            RunStats {
                sources_processed: 2,
                changes_detected: 3,
                alerts_emitted: 1,
                failures: 1,
                delivery_failures: 1,
                parse_warnings: 0,
            }
        );
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }

    #[test]
    fn gate_decides_once() {
        let gate = UnitGate::default();
        assert!(gate.commit());
        assert!(gate.commit());
        assert!(!gate.cancel());

        let gate = UnitGate::default();
        assert!(gate.cancel());
        assert!(!gate.commit());
    }

    #[test]
    fn deadline_error_message() {
        assert_eq!(UnitError::DeadlineExceeded.to_string(), "run deadline exceeded");
    }

    #[tokio::test]
    async fn unsupported_kind_fails_and_logs() {
        let store = Arc::new(lexwatch_store::MemoryStore::new());
        let dispatcher = Arc::new(AlertDispatcher::new(
            store.clone(),
            RetryPolicy::default(),
            86_400,
        ));
        let orch = MonitorOrchestrator::new(
            MonitorConfig::default(),
            FetcherSet::new(),
            store.clone(),
            store.clone(),
            dispatcher,
        )
        .unwrap();
        let source = Source::new("s", "http://x", SourceKind::Feed, PollFrequency::OnTrigger);
        let result = orch.check_source(&source).await;
        assert!(matches!(
            result.error,
            Some(UnitError::Fetch(FetchError::Unsupported(SourceKind::Feed)))
        ));
        let logs = store.logs("s").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, OperationOutcome::Failure);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store = Arc::new(lexwatch_store::MemoryStore::new());
        let config = MonitorConfig {
            concurrency: 0,
            ..MonitorConfig::default()
        };
        let err = MonitorOrchestrator::from_config(config, store, None).err().unwrap();
        assert!(matches!(err, SetupError::Config(_)));
    }
}
