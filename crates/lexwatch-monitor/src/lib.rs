//! Monitoring pipeline: per-source units of fetch, parse, reconcile and
//! dispatch, run with bounded concurrency under a run deadline.

pub mod dispatch;
pub mod orchestrator;
pub mod reconcile;

pub use dispatch::{
    AlertDispatcher, AlertRequest, AlertSink, BroadcastBus, BusMessage, BusSink, DeliveryError,
    EmitOutcome, MessageBus, WebhookSink,
};
pub use orchestrator::{MonitorOrchestrator, RunReport, RunResult, RunStats, SetupError, UnitError};
pub use reconcile::{ReconcileError, ReconcileOutcome, ReconciliationEngine};
