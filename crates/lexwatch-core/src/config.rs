//! Monitor configuration.
//!
//! Every section carries serde defaults, so an empty YAML document is a
//! valid configuration. Reading files is left to the caller; this module
//! only parses and validates.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Retry ──

/// Backoff parameters, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl RetryConfig {
    /// Defaults for source fetches: 5 attempts, 5 s → 300 s, 1 s jitter.
    pub fn fetch_default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            max_jitter_ms: 1_000,
            attempt_timeout_ms: 30_000,
        }
    }

    /// Defaults for sink deliveries: 3 attempts, 200 ms → 5 s.
    pub fn delivery_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            max_jitter_ms: 100,
            attempt_timeout_ms: 10_000,
        }
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid(field, "max_attempts must be at least 1"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid(field, "max_delay_ms is below base_delay_ms"));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(invalid(field, "attempt_timeout_ms must be positive"));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fetch_default()
    }
}

/// A retry section as written, before gaps are filled.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialRetry {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_jitter_ms: Option<u64>,
    attempt_timeout_ms: Option<u64>,
}

impl PartialRetry {
    fn or(self, base: RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            max_jitter_ms: self.max_jitter_ms.unwrap_or(base.max_jitter_ms),
            attempt_timeout_ms: self.attempt_timeout_ms.unwrap_or(base.attempt_timeout_ms),
        }
    }
}

fn delivery_retry<'de, D: Deserializer<'de>>(de: D) -> Result<RetryConfig, D::Error> {
    Ok(PartialRetry::deserialize(de)?.or(RetryConfig::delivery_default()))
}

// ── Classifier ──

/// Keyword lists and thresholds for the change classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Modals that create a binding obligation.
    pub obligatory_modals: Vec<String>,
    /// Modals that only permit.
    pub permissive_modals: Vec<String>,
    /// Any count change in these makes a change at least `major`.
    pub critical_keywords: Vec<String>,
    /// Tracked in `keywords_affected` without affecting the class.
    pub watch_keywords: Vec<String>,
    /// Edit ratio above which a textual change counts as `minor`.
    pub minor_edit_threshold: f64,
    pub major_score_floor: f64,
    pub critical_score_floor: f64,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            obligatory_modals: words(&["shall", "must"]),
            permissive_modals: words(&["may"]),
            critical_keywords: words(&[
                "required",
                "obligatory",
                "mandatory",
                "prohibited",
                "forbidden",
                "illegal",
                "criminal",
                "penalty",
                "fine",
                "sanction",
                "liability",
                "risk",
                "safety",
                "security",
                "privacy",
                "data protection",
            ]),
            watch_keywords: words(&[
                "should",
                "recommended",
                "guidance",
                "best practice",
                "documentation",
                "record",
                "audit",
                "compliance",
                "assessment",
                "evaluation",
                "monitoring",
                "supervision",
            ]),
            minor_edit_threshold: 0.02,
            major_score_floor: 0.5,
            critical_score_floor: 0.9,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |v: f64| (0.0..=1.0).contains(&v);
        if !unit(self.minor_edit_threshold) {
            return Err(invalid("classifier.minor_edit_threshold", "must be within [0, 1]"));
        }
        if !unit(self.major_score_floor) || !unit(self.critical_score_floor) {
            return Err(invalid("classifier", "score floors must be within [0, 1]"));
        }
        if self.major_score_floor >= self.critical_score_floor {
            return Err(invalid(
                "classifier.major_score_floor",
                "must be below critical_score_floor",
            ));
        }
        if self.major_score_floor < 0.5 {
            return Err(invalid(
                "classifier.major_score_floor",
                "must be at least 0.5 so minor scores stay below it",
            ));
        }
        if self.obligatory_modals.is_empty() {
            return Err(invalid("classifier.obligatory_modals", "must not be empty"));
        }
        Ok(())
    }
}

// ── Monitor ──

pub const DEFAULT_BUS_TOPIC: &str = "rule-update";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sources processed in parallel.
    pub concurrency: usize,
    /// Wall-clock budget for one run.
    pub run_deadline_secs: u64,
    /// Width of the alert de-duplication window.
    pub dedup_window_secs: u64,
    pub user_agent: String,
    pub respect_robots: bool,
    pub fetch_retry: RetryConfig,
    /// Partially specified sections fill the gaps from the delivery defaults.
    #[serde(deserialize_with = "delivery_retry")]
    pub delivery_retry: RetryConfig,
    pub classifier: ClassifierConfig,
    pub webhook_url: Option<String>,
    pub bus_topic: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            run_deadline_secs: 900,
            dedup_window_secs: 86_400,
            user_agent: concat!("lexwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            respect_robots: true,
            fetch_retry: RetryConfig::fetch_default(),
            delivery_retry: RetryConfig::delivery_default(),
            classifier: ClassifierConfig::default(),
            webhook_url: None,
            bus_topic: DEFAULT_BUS_TOPIC.to_string(),
        }
    }
}

impl MonitorConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        tracing::debug!(
            concurrency = config.concurrency,
            run_deadline_secs = config.run_deadline_secs,
            webhook = config.webhook_url.is_some(),
            "monitor config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(invalid("concurrency", "must be at least 1"));
        }
        if self.run_deadline_secs == 0 {
            return Err(invalid("run_deadline_secs", "must be positive"));
        }
        if self.dedup_window_secs == 0 {
            return Err(invalid("dedup_window_secs", "must be positive"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }
        if self.bus_topic.trim().is_empty() {
            return Err(invalid("bus_topic", "must not be empty"));
        }
        self.fetch_retry.validate("fetch_retry")?;
        self.delivery_retry.validate("delivery_retry")?;
        self.classifier.validate()
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs)
    }
}
