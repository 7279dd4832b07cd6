pub mod config;
pub mod hash;
pub mod model;
pub mod sections;

pub use config::{ClassifierConfig, ConfigError, MonitorConfig, RetryConfig};
pub use hash::{content_hash, normalize_document, normalize_text};
pub use model::{
    Alert, AlertId, AlertPayload, AlertPriority, ChangeRecord, ChangeType, DedupKey,
    DeliveryRecord, DeliveryStatus, OperationOutcome, PollFrequency, RawSnapshot, Regulation,
    RegulationId, RegulationStatus, RiskLevel, Rule, RuleId, Source, SourceKind,
    SourceOperationLog,
};
pub use sections::{ParseWarning, ParsedDocument, SectionNode, SectionTree, parse_sections};
