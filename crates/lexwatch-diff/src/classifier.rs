//! Keyword-signal classifier for section changes.
//!
//! Four classes, checked in priority order:
//!
//! 1. **critical**: an obligation is weakened. The total count of
//!    obligatory modals drops, or one of them disappears while permissive
//!    modals appear.
//! 2. **major**: the count of any critical keyword changes.
//! 3. **minor**: no keyword trigger, but the normalised edit ratio exceeds
//!    `minor_edit_threshold`.
//! 4. **none**: formatting-only delta.
//!
//! The result is a pure function of its inputs, including `detected_at`,
//! so re-processing the same pair always yields the same record.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use lexwatch_core::{ChangeRecord, ChangeType, ClassifierConfig, content_hash};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassificationError {
    #[error("invalid keyword pattern {keyword:?}: {reason}")]
    InvalidPattern { keyword: String, reason: String },

    #[error("invalid threshold {name} = {value}")]
    InvalidThreshold { name: &'static str, value: f64 },

    #[error("section code is empty")]
    EmptySectionCode,
}

/// Which list a keyword came from. Modals are counted separately from
/// the critical list so that swapping one obligatory modal for another
/// does not escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeywordClass {
    Obligatory,
    Permissive,
    Critical,
    Watch,
}

struct KeywordPattern {
    keyword: String,
    class: KeywordClass,
    re: Regex,
}

impl KeywordPattern {
    fn compile(keyword: &str, class: KeywordClass) -> Result<Self, ClassificationError> {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() {
            return Err(ClassificationError::InvalidPattern {
                keyword,
                reason: "empty keyword".into(),
            });
        }
        // Multi-word keywords match across any whitespace run.
        let body = keyword
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"\s+");
        let re = Regex::new(&format!(r"(?i)\b{body}\b")).map_err(|e| {
            ClassificationError::InvalidPattern {
                keyword: keyword.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self { keyword, class, re })
    }

    fn count(&self, text: &str) -> usize {
        self.re.find_iter(text).count()
    }
}

/// Per-keyword occurrence counts for one text.
type Counts = BTreeMap<String, usize>;

/// Classifies section changes against a fixed [`ClassifierConfig`].
pub struct DiffClassifier {
    config: ClassifierConfig,
    patterns: Vec<KeywordPattern>,
}

impl DiffClassifier {
    /// Compile the keyword patterns and check thresholds.
    pub fn new(config: ClassifierConfig) -> Result<Self, ClassificationError> {
        check_threshold("minor_edit_threshold", config.minor_edit_threshold)?;
        check_threshold("major_score_floor", config.major_score_floor)?;
        check_threshold("critical_score_floor", config.critical_score_floor)?;
        if config.major_score_floor < 0.5 || config.major_score_floor >= config.critical_score_floor
        {
            return Err(ClassificationError::InvalidThreshold {
                name: "major_score_floor",
                value: config.major_score_floor,
            });
        }

        let lists = [
            (&config.obligatory_modals, KeywordClass::Obligatory),
            (&config.permissive_modals, KeywordClass::Permissive),
            (&config.critical_keywords, KeywordClass::Critical),
            (&config.watch_keywords, KeywordClass::Watch),
        ];
        let mut patterns = Vec::new();
        let mut seen = BTreeSet::new();
        for (list, class) in lists {
            for keyword in list {
                let pattern = KeywordPattern::compile(keyword, class)?;
                // First list wins when a keyword is configured twice.
                if seen.insert(pattern.keyword.clone()) {
                    patterns.push(pattern);
                }
            }
        }

        Ok(Self { config, patterns })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify the change of one section.
    ///
    /// `old` is `None` when no rule exists yet for `section_code`.
    pub fn classify(
        &self,
        section_code: &str,
        old: Option<&str>,
        new: &str,
        detected_at: DateTime<Utc>,
    ) -> Result<ChangeRecord, ClassificationError> {
        if section_code.trim().is_empty() {
            return Err(ClassificationError::EmptySectionCode);
        }

        let new_hash = content_hash(new);
        let new_counts = self.count(new);

        let Some(old) = old else {
            return Ok(ChangeRecord {
                section_code: section_code.to_string(),
                old_hash: None,
                new_hash,
                change_type: ChangeType::New,
                severity_score: 0.0,
                keywords_affected: self.affected(&Counts::new(), &new_counts),
                detected_at,
            });
        };

        let old_hash = content_hash(old);
        if old_hash == new_hash {
            return Ok(ChangeRecord {
                section_code: section_code.to_string(),
                old_hash: Some(old_hash),
                new_hash,
                change_type: ChangeType::Unchanged,
                severity_score: 0.0,
                keywords_affected: BTreeSet::new(),
                detected_at,
            });
        }

        let old_counts = self.count(old);
        let ratio = edit_ratio(old, new);
        let critical_hits = self.changed(&old_counts, &new_counts, KeywordClass::Critical);

        let change_type = if self.weakens_obligation(&old_counts, &new_counts) {
            ChangeType::Critical
        } else if critical_hits > 0 {
            ChangeType::Major
        } else if ratio > self.config.minor_edit_threshold {
            ChangeType::Minor
        } else {
            ChangeType::Unchanged
        };

        let severity_score = self.score(change_type, ratio, critical_hits);
        let keywords_affected = if change_type == ChangeType::Unchanged {
            BTreeSet::new()
        } else {
            self.affected(&old_counts, &new_counts)
        };

        tracing::debug!(
            section = section_code,
            change = %change_type,
            ratio,
            critical_hits,
            "classified section change"
        );

        Ok(ChangeRecord {
            section_code: section_code.to_string(),
            old_hash: Some(old_hash),
            new_hash,
            change_type,
            severity_score,
            keywords_affected,
            detected_at,
        })
    }

    fn count(&self, text: &str) -> Counts {
        self.patterns
            .iter()
            .map(|p| (p.keyword.clone(), p.count(text)))
            .collect()
    }

    fn total(&self, counts: &Counts, class: KeywordClass) -> usize {
        self.patterns
            .iter()
            .filter(|p| p.class == class)
            .map(|p| counts.get(&p.keyword).copied().unwrap_or(0))
            .sum()
    }

    /// Number of keywords of `class` whose counts differ.
    fn changed(&self, old: &Counts, new: &Counts, class: KeywordClass) -> usize {
        self.patterns
            .iter()
            .filter(|p| p.class == class && old.get(&p.keyword) != new.get(&p.keyword))
            .count()
    }

    fn weakens_obligation(&self, old: &Counts, new: &Counts) -> bool {
        let old_total = self.total(old, KeywordClass::Obligatory);
        let new_total = self.total(new, KeywordClass::Obligatory);
        if new_total < old_total {
            return true;
        }
        let modal_removed = self.patterns.iter().any(|p| {
            p.class == KeywordClass::Obligatory
                && new.get(&p.keyword).copied().unwrap_or(0)
                    < old.get(&p.keyword).copied().unwrap_or(0)
        });
        let permissive_added = self.total(new, KeywordClass::Permissive)
            > self.total(old, KeywordClass::Permissive);
        modal_removed && permissive_added
    }

    fn affected(&self, old: &Counts, new: &Counts) -> BTreeSet<String> {
        self.patterns
            .iter()
            .filter(|p| {
                old.get(&p.keyword).copied().unwrap_or(0)
                    != new.get(&p.keyword).copied().unwrap_or(0)
            })
            .map(|p| p.keyword.clone())
            .collect()
    }

    fn score(&self, change_type: ChangeType, ratio: f64, critical_hits: usize) -> f64 {
        let major = self.config.major_score_floor;
        let critical = self.config.critical_score_floor;
        match change_type {
            ChangeType::New | ChangeType::Unchanged => 0.0,
            ChangeType::Minor => (ratio * 0.5).min(just_below(major)),
            ChangeType::Major => {
                let weight = (ratio + 0.1 * critical_hits as f64).min(1.0);
                (major + (critical - major) * weight).min(just_below(critical))
            }
            ChangeType::Critical => (critical + (1.0 - critical) * ratio).min(1.0),
        }
    }
}

fn check_threshold(name: &'static str, value: f64) -> Result<(), ClassificationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ClassificationError::InvalidThreshold { name, value })
    }
}

fn just_below(x: f64) -> f64 {
    x - 1e-6
}

/// Case-fold, drop punctuation, collapse whitespace.
fn comparable(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Share of the text that was edited: `1 - normalized_levenshtein`,
/// in `[0, 1]`, over case-folded, punctuation-free text.
pub fn edit_ratio(old: &str, new: &str) -> f64 {
    let a = comparable(old);
    let b = comparable(new);
    (1.0 - strsim::normalized_levenshtein(&a, &b)).clamp(0.0, 1.0)
}
