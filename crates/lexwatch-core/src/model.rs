//! Shared data model: sources, snapshots, regulations, rules, change records,
//! alerts, and operation logs.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::content_hash;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a stored [`Regulation`].
    RegulationId
);
uuid_id!(
    /// Identifier of a stored [`Rule`].
    RuleId
);
uuid_id!(
    /// Identifier of an emitted [`Alert`].
    AlertId
);

// ── Sources ──

/// The three fetch-capability variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Metadata-query endpoint addressed by an external identifier.
    Structured,
    /// Syndication feed (RSS 2.0 or Atom).
    Feed,
    /// Plain web page, body text extracted heuristically.
    Generic,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Feed => "feed",
            Self::Generic => "generic",
        }
    }
}

/// How often a source should be polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PollFrequency {
    Every(Duration),
    /// Only fetched when explicitly triggered.
    OnTrigger,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid poll frequency {0:?} (expected e.g. \"6h\", \"30m\", \"1d\" or \"on-trigger\")")]
pub struct InvalidFrequency(pub String);

impl FromStr for PollFrequency {
    type Err = InvalidFrequency;

    /// Parse `"90s"`, `"30m"`, `"6h"`, `"1d"`, `"on-trigger"` or `"instant"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim().to_ascii_lowercase();
        if t == "on-trigger" || t == "instant" {
            return Ok(Self::OnTrigger);
        }
        let err = || InvalidFrequency(s.to_string());
        let split = t.len().checked_sub(1).ok_or_else(err)?;
        let (num, unit) = t.split_at(split);
        let n: u64 = num.parse().map_err(|_| err())?;
        let secs = match unit {
            "s" => n,
            "m" => n * 60,
            "h" => n * 3_600,
            "d" => n * 86_400,
            _ => return Err(err()),
        };
        if secs == 0 {
            return Err(err());
        }
        Ok(Self::Every(Duration::from_secs(secs)))
    }
}

impl TryFrom<String> for PollFrequency {
    type Error = InvalidFrequency;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PollFrequency> for String {
    fn from(value: PollFrequency) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PollFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnTrigger => f.write_str("on-trigger"),
            Self::Every(d) => {
                let secs = d.as_secs();
                if secs % 86_400 == 0 {
                    write!(f, "{}d", secs / 86_400)
                } else if secs % 3_600 == 0 {
                    write!(f, "{}h", secs / 3_600)
                } else if secs % 60 == 0 {
                    write!(f, "{}m", secs / 60)
                } else {
                    write!(f, "{secs}s")
                }
            }
        }
    }
}

/// A monitored publication endpoint.
///
/// Everything except `active` is fixed once the descriptor is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    id: String,
    url: String,
    kind: SourceKind,
    poll_frequency: PollFrequency,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

impl Source {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        kind: SourceKind,
        poll_frequency: PollFrequency,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            kind,
            poll_frequency,
            external_id: None,
            active: true,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn poll_frequency(&self) -> PollFrequency {
        self.poll_frequency
    }

    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Whether a scheduled run should poll this source.
    ///
    /// `OnTrigger` sources are never due by schedule. A periodic source that
    /// has never succeeded is always due.
    pub fn is_due(&self, last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self.poll_frequency {
            PollFrequency::OnTrigger => false,
            PollFrequency::Every(every) => match last_success {
                None => true,
                Some(last) => {
                    let every = chrono::Duration::from_std(every).unwrap_or(chrono::Duration::MAX);
                    now - last >= every
                }
            },
        }
    }
}

/// One successful fetch of a source document. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub title: String,
    pub version_label: String,
    pub full_text: String,
    pub content_hash: String,
    /// Key of the regulation this text belongs to.
    pub document_key: String,
    pub document_url: String,
}

impl RawSnapshot {
    pub fn new(
        source_id: impl Into<String>,
        document_key: impl Into<String>,
        document_url: impl Into<String>,
        title: impl Into<String>,
        version_label: impl Into<String>,
        full_text: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let full_text = full_text.into();
        Self {
            source_id: source_id.into(),
            fetched_at,
            title: title.into(),
            version_label: version_label.into(),
            content_hash: content_hash(&full_text),
            full_text,
            document_key: document_key.into(),
            document_url: document_url.into(),
        }
    }
}

// ── Regulations and rules ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegulationStatus {
    Draft,
    Active,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Regulation {
    pub id: RegulationId,
    pub key: String,
    pub name: String,
    pub version: String,
    pub status: RegulationStatus,
    pub source_url: String,
    pub last_updated: DateTime<Utc>,
    /// Incremented on every committed write; used to detect concurrent writers.
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub regulation_id: RegulationId,
    pub section_code: String,
    pub parent_code: Option<String>,
    pub title: String,
    pub content: String,
    pub content_hash: String,
    pub risk_level: RiskLevel,
    pub version: String,
    pub last_changed_at: DateTime<Utc>,
}

// ── Changes ──

/// Legal severity of a section change, in increasing order of importance
/// for the alerting classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Section seen for the first time.
    New,
    /// No substantive change.
    #[serde(rename = "none")]
    Unchanged,
    Minor,
    Major,
    Critical,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Unchanged => "none",
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }

    /// Alert priority requested for this change, if it alerts at all.
    pub fn alert_priority(&self) -> Option<AlertPriority> {
        match self {
            Self::New | Self::Unchanged => None,
            Self::Minor => Some(AlertPriority::Normal),
            Self::Major | Self::Critical => Some(AlertPriority::Urgent),
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub section_code: String,
    pub old_hash: Option<String>,
    pub new_hash: String,
    pub change_type: ChangeType,
    pub severity_score: f64,
    pub keywords_affected: BTreeSet<String>,
    pub detected_at: DateTime<Utc>,
}

// ── Alerts ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Normal,
    Urgent,
}

/// Identity of "the same change" across runs: `(rule_id, change_type, run_window)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Build the key for a change observed at `at`, bucketed into windows of
    /// `window_secs` seconds since the Unix epoch.
    pub fn new(rule_id: RuleId, change_type: ChangeType, at: DateTime<Utc>, window_secs: u64) -> Self {
        let window = at.timestamp().div_euclid(window_secs.max(1) as i64);
        Self(format!("{rule_id}:{change_type}:{window}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub rule_id: RuleId,
    pub section_code: String,
    pub alert_type: String,
    pub change_type: ChangeType,
    pub priority: AlertPriority,
    pub message: String,
    pub dedup_key: DedupKey,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn payload(&self) -> AlertPayload {
        AlertPayload {
            rule_id: self.rule_id,
            section_code: self.section_code.clone(),
            change_type: self.change_type,
            priority: self.priority,
            message: self.message.clone(),
            dedup_key: self.dedup_key.clone(),
            created_at: self.created_at,
        }
    }
}

/// The structured record delivered to notification sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub rule_id: RuleId,
    pub section_code: String,
    pub change_type: ChangeType,
    pub priority: AlertPriority,
    pub message: String,
    pub dedup_key: DedupKey,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    PermanentlyFailed,
}

/// Outcome of delivering one alert to one sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub alert_id: AlertId,
    pub sink: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub error_detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ── Operation log ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Success,
    Failure,
    RetryExhausted,
}

/// One fetch attempt against a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOperationLog {
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: OperationOutcome,
    pub attempt_count: u32,
    pub error_detail: Option<String>,
}
