//! Alert construction, de-duplication, and fan-out to notification sinks.
//!
//! One [`AlertDispatcher`] is built per process and shared by `Arc`. Each
//! sink is retried independently with the delivery policy; whatever the
//! outcome, a [`DeliveryRecord`] is written.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use lexwatch_core::{
    Alert, AlertId, AlertPayload, ChangeType, DedupKey, DeliveryRecord, DeliveryStatus,
    MonitorConfig, RuleId,
};
use lexwatch_fetch::{RetryExecutor, RetryPolicy, Retryable};
use lexwatch_store::{AlertStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const ALERT_TYPE_RULE_UPDATED: &str = "rule_updated";

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("delivery timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("sink returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("message bus error: {0}")]
    Bus(String),
    #[error("payload encoding failed: {0}")]
    Encode(String),
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) | Self::Bus(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::Encode(_) | Self::DeadlineExceeded => false,
        }
    }
}

impl Retryable for DeliveryError {
    fn is_transient(&self) -> bool {
        DeliveryError::is_transient(self)
    }

    fn timed_out() -> Self {
        Self::Timeout
    }

    fn deadline_exceeded() -> Self {
        Self::DeadlineExceeded
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_builder() {
            Self::Encode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

// ── Sinks ──

/// A notification target.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Stable name used in delivery records.
    fn name(&self) -> &str;

    async fn deliver(&self, payload: &AlertPayload) -> Result<(), DeliveryError>;
}

/// POSTs the JSON payload and expects a 2xx.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    name: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let url = url.into();
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            name: format!("webhook:{url}"),
            url,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, payload: &AlertPayload) -> Result<(), DeliveryError> {
        let resp = self.client.post(&self.url).json(payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// A payload published on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: AlertPayload,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: BusMessage) -> Result<(), DeliveryError>;
}

/// In-process bus on a tokio broadcast channel. Publishing with no
/// subscribers succeeds; the message is simply not observed.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBus for BroadcastBus {
    async fn publish(&self, message: BusMessage) -> Result<(), DeliveryError> {
        match self.tx.send(message) {
            Ok(receivers) => debug!(receivers, "published to bus"),
            Err(_) => debug!("published to bus with no subscribers"),
        }
        Ok(())
    }
}

/// Publishes every alert on one fixed topic.
pub struct BusSink {
    bus: Arc<dyn MessageBus>,
    topic: String,
    name: String,
}

impl BusSink {
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            bus,
            name: format!("bus:{topic}"),
            topic,
        }
    }
}

#[async_trait]
impl AlertSink for BusSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, payload: &AlertPayload) -> Result<(), DeliveryError> {
        self.bus
            .publish(BusMessage {
                topic: self.topic.clone(),
                payload: payload.clone(),
            })
            .await
    }
}

// ── Dispatcher ──

/// A rule update that should alert, as produced by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRequest {
    pub rule_id: RuleId,
    pub section_code: String,
    /// Name of the owning regulation, for the message.
    pub regulation: String,
    pub change_type: ChangeType,
    pub severity_score: f64,
    pub keywords_affected: BTreeSet<String>,
}

impl AlertRequest {
    fn message(&self) -> String {
        let mut msg = format!(
            "{} {} change (severity {:.2})",
            self.section_code, self.change_type, self.severity_score
        );
        if !self.regulation.is_empty() {
            msg = format!("{}: {msg}", self.regulation);
        }
        if !self.keywords_affected.is_empty() {
            let keywords: Vec<&str> = self.keywords_affected.iter().map(String::as_str).collect();
            msg.push_str(&format!("; keywords: {}", keywords.join(", ")));
        }
        msg
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmitOutcome {
    Emitted {
        alert: Alert,
        deliveries: Vec<DeliveryRecord>,
    },
    /// An unresolved alert with the same dedup key already exists.
    Duplicate(DedupKey),
    /// The change type never alerts.
    NotAlertable,
}

impl EmitOutcome {
    pub fn failed_deliveries(&self) -> usize {
        match self {
            Self::Emitted { deliveries, .. } => deliveries
                .iter()
                .filter(|d| d.status == DeliveryStatus::PermanentlyFailed)
                .count(),
            _ => 0,
        }
    }
}

pub struct AlertDispatcher {
    store: Arc<dyn AlertStore>,
    sinks: Vec<Arc<dyn AlertSink>>,
    retry: RetryExecutor,
    dedup_window_secs: u64,
}

impl AlertDispatcher {
    pub fn new(store: Arc<dyn AlertStore>, policy: RetryPolicy, dedup_window_secs: u64) -> Self {
        Self {
            store,
            sinks: Vec::new(),
            retry: RetryExecutor::new(policy),
            dedup_window_secs,
        }
    }

    /// Dispatcher with the sinks named by `config`: a webhook when
    /// `webhook_url` is set and the bus when one is supplied.
    pub fn from_config(
        store: Arc<dyn AlertStore>,
        config: &MonitorConfig,
        bus: Option<Arc<dyn MessageBus>>,
    ) -> Result<Self, DeliveryError> {
        let policy = RetryPolicy::from(&config.delivery_retry);
        let mut dispatcher = Self::new(store, policy.clone(), config.dedup_window_secs);
        if let Some(url) = &config.webhook_url {
            dispatcher = dispatcher.with_sink(Arc::new(WebhookSink::new(
                url.clone(),
                policy.attempt_timeout,
            )?));
        }
        if let Some(bus) = bus {
            dispatcher = dispatcher.with_sink(Arc::new(BusSink::new(bus, &config.bus_topic)));
        }
        Ok(dispatcher)
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub async fn emit(
        &self,
        request: &AlertRequest,
        deadline: Option<Instant>,
    ) -> Result<EmitOutcome, StoreError> {
        self.emit_at(request, Utc::now(), deadline).await
    }

    /// Build the alert as of `now`, insert it unless its dedup key is
    /// already open, then deliver to every sink.
    pub async fn emit_at(
        &self,
        request: &AlertRequest,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<EmitOutcome, StoreError> {
        let Some(priority) = request.change_type.alert_priority() else {
            return Ok(EmitOutcome::NotAlertable);
        };
        let dedup_key = DedupKey::new(
            request.rule_id,
            request.change_type,
            now,
            self.dedup_window_secs,
        );
        let alert = Alert {
            id: AlertId::new(),
            rule_id: request.rule_id,
            section_code: request.section_code.clone(),
            alert_type: ALERT_TYPE_RULE_UPDATED.to_string(),
            change_type: request.change_type,
            priority,
            message: request.message(),
            dedup_key: dedup_key.clone(),
            created_at: now,
            resolved_at: None,
        };

        if !self.store.insert_if_absent(alert.clone())? {
            debug!(dedup_key = %dedup_key, "duplicate alert suppressed");
            return Ok(EmitOutcome::Duplicate(dedup_key));
        }
        info!(alert_id = %alert.id, section = %alert.section_code, change_type = %alert.change_type, "alert emitted");

        let deliveries = self.deliver(&alert, deadline).await;
        Ok(EmitOutcome::Emitted { alert, deliveries })
    }

    /// Deliver to all sinks concurrently and record each outcome.
    pub async fn deliver(&self, alert: &Alert, deadline: Option<Instant>) -> Vec<DeliveryRecord> {
        let payload = alert.payload();
        let deliveries = self.sinks.iter().map(|sink| {
            let payload = &payload;
            async move {
                let report = self
                    .retry
                    .execute(deadline, |_| sink.deliver(payload))
                    .await;
                let (status, error_detail) = match report.result {
                    Ok(()) => (DeliveryStatus::Delivered, None),
                    Err(e) => {
                        warn!(alert_id = %alert.id, sink = sink.name(), "delivery permanently failed: {e}");
                        (DeliveryStatus::PermanentlyFailed, Some(e.to_string()))
                    }
                };
                DeliveryRecord {
                    alert_id: alert.id,
                    sink: sink.name().to_string(),
                    status,
                    attempts: report.attempts.len() as u32,
                    error_detail,
                    recorded_at: Utc::now(),
                }
            }
        });
        let records = join_all(deliveries).await;

        for record in &records {
            if let Err(e) = self.store.record_delivery(record.clone()) {
                warn!(alert_id = %alert.id, sink = %record.sink, "failed to record delivery: {e}");
            }
        }
        records
    }

    /// Mark an alert resolved so its dedup key can fire again.
    pub fn resolve(&self, id: AlertId) -> Result<Alert, StoreError> {
        self.store.resolve(id, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::TimeZone;
    use lexwatch_store::MemoryStore;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_jitter: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn request(change_type: ChangeType) -> AlertRequest {
        AlertRequest {
            rule_id: RuleId::new(),
            section_code: "Article9.1".into(),
            regulation: "AI Act".into(),
            change_type,
            severity_score: 0.95,
            keywords_affected: ["may", "shall"].into_iter().map(String::from).collect(),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    /// Fails `failures` times with `error`, then succeeds.
    struct Flaky {
        failures: u32,
        error: DeliveryError,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, error: DeliveryError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AlertSink for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, _: &AlertPayload) -> Result<(), DeliveryError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_key_is_suppressed_until_resolved() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = AlertDispatcher::new(store.clone(), fast_policy(1), 86_400);
        let req = request(ChangeType::Critical);

        let first = dispatcher.emit_at(&req, noon(), None).await.unwrap();
        let EmitOutcome::Emitted { alert, .. } = first else {
            panic!("expected an emitted alert, got {first:?}");
        };
        assert_eq!(alert.priority, lexwatch_core::AlertPriority::Urgent);
        assert_eq!(alert.alert_type, "rule_updated");
        assert!(alert.message.contains("Article9.1 critical change"));

        let later = noon() + chrono::Duration::hours(3);
        assert!(matches!(
            dispatcher.emit_at(&req, later, None).await.unwrap(),
            EmitOutcome::Duplicate(_)
        ));

        dispatcher.resolve(alert.id).unwrap();
        assert!(matches!(
            dispatcher.emit_at(&req, later, None).await.unwrap(),
            EmitOutcome::Emitted { .. }
        ));
        assert_eq!(store.alerts().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn new_and_unchanged_never_alert() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = AlertDispatcher::new(store.clone(), fast_policy(1), 86_400);
        for ct in [ChangeType::New, ChangeType::Unchanged] {
            assert_eq!(
                dispatcher.emit_at(&request(ct), noon(), None).await.unwrap(),
                EmitOutcome::NotAlertable
            );
        }
        assert!(store.alerts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn minor_change_is_normal_priority() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = AlertDispatcher::new(store, fast_policy(1), 86_400);
        let out = dispatcher
            .emit_at(&request(ChangeType::Minor), noon(), None)
            .await
            .unwrap();
        let EmitOutcome::Emitted { alert, .. } = out else {
            panic!("expected an emitted alert");
        };
        assert_eq!(alert.priority, lexwatch_core::AlertPriority::Normal);
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_others() {
        let store = Arc::new(MemoryStore::new());
        let broken = Flaky::new(u32::MAX, DeliveryError::Transport("refused".into()));
        let healthy = Flaky::new(0, DeliveryError::Timeout);
        let bus = Arc::new(BroadcastBus::default());
        let mut rx = bus.subscribe();

        let dispatcher = AlertDispatcher::new(store.clone(), fast_policy(3), 86_400)
            .with_sink(broken.clone())
            .with_sink(Arc::new(BusSink::new(bus, "rule-update")))
            .with_sink(healthy);

        let out = dispatcher
            .emit_at(&request(ChangeType::Major), noon(), None)
            .await
            .unwrap();
        assert_eq!(out.failed_deliveries(), 1);
        let EmitOutcome::Emitted { alert, deliveries } = out else {
            panic!("expected an emitted alert");
        };

        assert_eq!(broken.calls.load(Ordering::SeqCst), 3);
        assert_eq!(deliveries[0].status, DeliveryStatus::PermanentlyFailed);
        assert_eq!(deliveries[0].attempts, 3);
        assert_eq!(deliveries[1].status, DeliveryStatus::Delivered);
        assert_eq!(deliveries[1].sink, "bus:rule-update");
        assert_eq!(deliveries[2].status, DeliveryStatus::Delivered);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "rule-update");
        assert_eq!(msg.payload, alert.payload());
        assert_eq!(store.deliveries(alert.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn terminal_rejection_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let sink = Flaky::new(
            u32::MAX,
            DeliveryError::Rejected {
                status: 400,
                body: "bad".into(),
            },
        );
        let dispatcher =
            AlertDispatcher::new(store, fast_policy(3), 86_400).with_sink(sink.clone());
        let out = dispatcher
            .emit_at(&request(ChangeType::Major), noon(), None)
            .await
            .unwrap();
        assert_eq!(out.failed_deliveries(), 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_recovers() {
        let store = Arc::new(MemoryStore::new());
        let sink = Flaky::new(2, DeliveryError::Timeout);
        let dispatcher =
            AlertDispatcher::new(store, fast_policy(3), 86_400).with_sink(sink.clone());
        let out = dispatcher
            .emit_at(&request(ChangeType::Critical), noon(), None)
            .await
            .unwrap();
        let EmitOutcome::Emitted { deliveries, .. } = out else {
            panic!("expected an emitted alert");
        };
        assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
        assert_eq!(deliveries[0].attempts, 3);
    }

    #[tokio::test]
    async fn webhook_posts_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/rules"))
            .and(body_partial_json(serde_json::json!({
                "section_code": "Article9.1",
                "change_type": "critical",
                "priority": "urgent"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(
            format!("{}/hooks/rules", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap();
        let store = Arc::new(MemoryStore::new());
        let dispatcher =
            AlertDispatcher::new(store, fast_policy(2), 86_400).with_sink(Arc::new(sink));
        let out = dispatcher
            .emit_at(&request(ChangeType::Critical), noon(), None)
            .await
            .unwrap();
        assert_eq!(out.failed_deliveries(), 0);
    }

    #[tokio::test]
    async fn webhook_server_error_is_retried_then_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let sink = WebhookSink::new(server.uri(), Duration::from_secs(5)).unwrap();
        let store = Arc::new(MemoryStore::new());
        let dispatcher =
            AlertDispatcher::new(store.clone(), fast_policy(2), 86_400).with_sink(Arc::new(sink));
        let out = dispatcher
            .emit_at(&request(ChangeType::Major), noon(), None)
            .await
            .unwrap();
        let EmitOutcome::Emitted { alert, .. } = out else {
            panic!("expected an emitted alert");
        };
        let recorded = store.deliveries(alert.id).unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, DeliveryStatus::PermanentlyFailed);
        assert!(recorded[0].error_detail.as_deref().unwrap().contains("503"));
    }

    #[test]
    fn from_config_builds_configured_sinks() {
        let store = Arc::new(MemoryStore::new());
        let config = MonitorConfig {
            webhook_url: Some("http://localhost:9/hook".into()),
            ..MonitorConfig::default()
        };
        let bus: Arc<dyn MessageBus> = Arc::new(BroadcastBus::default());
        let dispatcher = AlertDispatcher::from_config(store, &config, Some(bus)).unwrap();
        assert_eq!(
            dispatcher.sink_names(),
            vec!["webhook:http://localhost:9/hook", "bus:rule-update"]
        );
    }
}
