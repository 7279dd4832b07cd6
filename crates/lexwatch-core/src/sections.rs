//! Hierarchical section parsing for regulatory texts.
//!
//! Splits a document into a tree of sections addressed by dotted codes:
//!
//! - Root headings: `Article 9` → `Article9`, `ANNEX IV` → `AnnexIV`
//! - Numbered paragraphs: `1.` → `<parent>.1`
//! - Lettered points: `(a)` → `<parent>.a`
//!
//! The scan is a single pass over lines with an explicit stack of open
//! sections. Nodes live in a flat arena indexed by code, so the tree can be
//! flattened to `code → text` and rebuilt from the codes alone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::normalize_document;

static ARTICLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*article\s+(\d+[a-z]?)\b(.*)$").unwrap());

static ANNEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*annex\s+([ivxlc]+)\b(.*)$").unwrap());

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)\.(\s+.*)?$").unwrap());

static LETTERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\(([a-z])\)(\s+.*)?$").unwrap());

static BLANK_RUNS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Separator between code components.
pub const CODE_DELIMITER: char = '.';

/// One node of the section tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionNode {
    pub code: String,
    pub parent_code: Option<String>,
    pub title: String,
    /// The section's own text, excluding its children.
    pub text: String,
    pub depth: usize,
}

/// Non-fatal problems found while parsing. Parsing always continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ParseWarning {
    #[error("line {line}: {code} skips a level, attached under {parent_code}")]
    UnexpectedDepth {
        line: usize,
        code: String,
        parent_code: String,
    },
    #[error("line {line}: marker {marker:?} appears before any top-level section")]
    OrphanMarker { line: usize, marker: String },
    #[error("line {line}: section {code} repeated, text appended to the first occurrence")]
    DuplicateCode { line: usize, code: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SectionError {
    #[error("section {code} has no parent {parent_code} in the input")]
    MissingParent { code: String, parent_code: String },
    #[error("section code {0} appears more than once")]
    DuplicateCode(String),
    #[error("empty section code")]
    EmptyCode,
}

/// The code of the enclosing section: everything before the last delimiter.
///
/// "AnnexIV.1.a" → Some("AnnexIV.1"), "Article9" → None
pub fn parent_code_of(code: &str) -> Option<&str> {
    code.rsplit_once(CODE_DELIMITER).map(|(parent, _)| parent)
}

fn depth_of(code: &str) -> usize {
    code.matches(CODE_DELIMITER).count()
}

/// Arena of section nodes in document order, indexed by code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionTree {
    nodes: Vec<SectionNode>,
    index: HashMap<String, usize>,
}

impl SectionTree {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in document order.
    pub fn nodes(&self) -> &[SectionNode] {
        &self.nodes
    }

    pub fn get(&self, code: &str) -> Option<&SectionNode> {
        self.index.get(code).map(|&i| &self.nodes[i])
    }

    pub fn roots(&self) -> impl Iterator<Item = &SectionNode> {
        self.nodes.iter().filter(|n| n.parent_code.is_none())
    }

    /// Direct children of `code`, in document order.
    pub fn children<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a SectionNode> + 'a {
        self.nodes
            .iter()
            .filter(move |n| n.parent_code.as_deref() == Some(code))
    }

    /// `(code, text)` pairs in document order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes.iter().map(|n| (n.code.as_str(), n.text.as_str()))
    }

    /// Flattened `section_code → text` map.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        self.nodes
            .iter()
            .map(|n| (n.code.clone(), n.text.clone()))
            .collect()
    }

    /// Rebuild a tree from flattened `(code, text)` pairs.
    ///
    /// Parent links and depths are derived from the codes. Every non-root
    /// code's parent must be present somewhere in the input. Titles are not
    /// part of the flattened form and come back empty.
    pub fn from_flat<I, K, V>(entries: I) -> Result<Self, SectionError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let pairs: Vec<(String, String)> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut codes = HashSet::with_capacity(pairs.len());
        for (code, _) in &pairs {
            if code.is_empty() {
                return Err(SectionError::EmptyCode);
            }
            if !codes.insert(code.as_str()) {
                return Err(SectionError::DuplicateCode(code.clone()));
            }
        }
        for (code, _) in &pairs {
            if let Some(parent) = parent_code_of(code)
                && !codes.contains(parent)
            {
                return Err(SectionError::MissingParent {
                    code: code.clone(),
                    parent_code: parent.to_string(),
                });
            }
        }

        let mut tree = Self::default();
        for (code, text) in pairs {
            let node = SectionNode {
                parent_code: parent_code_of(&code).map(str::to_string),
                depth: depth_of(&code),
                title: String::new(),
                text,
                code,
            };
            tree.push(node);
        }
        Ok(tree)
    }

    fn push(&mut self, node: SectionNode) -> usize {
        let idx = self.nodes.len();
        self.index.insert(node.code.clone(), idx);
        self.nodes.push(node);
        idx
    }

    fn index_of(&self, code: &str) -> Option<usize> {
        self.index.get(code).copied()
    }
}

/// Parser output: the tree plus any non-fatal warnings.
#[derive(Debug, Clone, Default)]
pub struct ParsedDocument {
    pub tree: SectionTree,
    pub warnings: Vec<ParseWarning>,
    /// Text before the first top-level heading.
    pub preamble: String,
}

// ── Marker recognition ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerLevel {
    Root = 0,
    Numbered = 1,
    Lettered = 2,
}

struct Marker<'a> {
    level: MarkerLevel,
    token: String,
    rest: &'a str,
}

fn recognize(line: &str) -> Option<Marker<'_>> {
    if let Some(c) = ARTICLE_RE.captures(line) {
        return Some(Marker {
            level: MarkerLevel::Root,
            token: format!("Article{}", c[1].to_ascii_lowercase()),
            rest: c.get(2).map_or("", |m| m.as_str()),
        });
    }
    if let Some(c) = ANNEX_RE.captures(line) {
        return Some(Marker {
            level: MarkerLevel::Root,
            token: format!("Annex{}", c[1].to_ascii_uppercase()),
            rest: c.get(2).map_or("", |m| m.as_str()),
        });
    }
    if let Some(c) = NUMBERED_RE.captures(line) {
        return Some(Marker {
            level: MarkerLevel::Numbered,
            token: c[1].to_string(),
            rest: c.get(2).map_or("", |m| m.as_str()),
        });
    }
    if let Some(c) = LETTERED_RE.captures(line) {
        return Some(Marker {
            level: MarkerLevel::Lettered,
            token: c[1].to_string(),
            rest: c.get(2).map_or("", |m| m.as_str()),
        });
    }
    None
}

/// "— Risk management system" → "Risk management system"
fn heading_title(rest: &str) -> String {
    rest.trim()
        .trim_start_matches(['-', '–', '—'])
        .trim()
        .to_string()
}

fn tidy(lines: &[&str]) -> String {
    let joined = lines.join("\n");
    BLANK_RUNS_RE.replace_all(joined.trim(), "\n\n").into_owned()
}

// ── Parser ──

struct Open {
    idx: usize,
    level: MarkerLevel,
}

/// Parse a document into its section tree.
pub fn parse_sections(text: &str) -> ParsedDocument {
    let normalized = normalize_document(text);

    let mut tree = SectionTree::default();
    let mut bodies: Vec<Vec<&str>> = Vec::new();
    let mut preamble: Vec<&str> = Vec::new();
    let mut warnings = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    // Root heading whose title is expected on the next non-empty line.
    let mut pending_title: Option<usize> = None;

    for (i, line) in normalized.split('\n').enumerate() {
        let line_no = i + 1;

        let Some(marker) = recognize(line) else {
            if let Some(idx) = pending_title
                && !line.trim().is_empty()
            {
                tree.nodes[idx].title = line.trim().to_string();
                pending_title = None;
                continue;
            }
            match stack.last() {
                Some(open) => bodies[open.idx].push(line),
                None => preamble.push(line),
            }
            continue;
        };
        pending_title = None;

        let (code, parent_code) = if marker.level == MarkerLevel::Root {
            stack.clear();
            (marker.token.clone(), None)
        } else {
            while stack.last().is_some_and(|top| top.level as u8 >= marker.level as u8) {
                stack.pop();
            }
            let Some(top) = stack.last() else {
                warnings.push(ParseWarning::OrphanMarker {
                    line: line_no,
                    marker: line.trim().to_string(),
                });
                preamble.push(line);
                continue;
            };
            let parent = tree.nodes[top.idx].code.clone();
            let code = format!("{parent}{CODE_DELIMITER}{}", marker.token);
            if (top.level as u8) + 1 < marker.level as u8 {
                warnings.push(ParseWarning::UnexpectedDepth {
                    line: line_no,
                    code: code.clone(),
                    parent_code: parent.clone(),
                });
            }
            (code, Some(parent))
        };

        let idx = match tree.index_of(&code) {
            Some(existing) => {
                warnings.push(ParseWarning::DuplicateCode {
                    line: line_no,
                    code: code.clone(),
                });
                existing
            }
            None => {
                let depth = parent_code
                    .as_deref()
                    .and_then(|p| tree.get(p))
                    .map_or(0, |p| p.depth + 1);
                let title = if marker.level == MarkerLevel::Root {
                    heading_title(marker.rest)
                } else {
                    String::new()
                };
                bodies.push(Vec::new());
                tree.push(SectionNode {
                    code,
                    parent_code,
                    title,
                    text: String::new(),
                    depth,
                })
            }
        };

        if marker.level == MarkerLevel::Root {
            if tree.nodes[idx].title.is_empty() {
                pending_title = Some(idx);
            }
        } else {
            let rest = marker.rest.trim();
            if !rest.is_empty() {
                bodies[idx].push(rest);
            }
        }

        stack.push(Open {
            idx,
            level: marker.level,
        });
    }

    for (node, body) in tree.nodes.iter_mut().zip(&bodies) {
        node.text = tidy(body);
    }

    ParsedDocument {
        tree,
        warnings,
        preamble: tidy(&preamble),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ANNEX_IV: &str = "\
ANNEX IV
Technical documentation referred to in Article 11(1)

1. General information
The technical documentation shall contain:
(a) Name and contact details of the provider;
(b) the intended purpose of the system;
2. A detailed description of the elements of the AI system
(a) the methods and steps performed for the development;
";

    fn assert_hierarchy(tree: &SectionTree) {
        for node in tree.nodes() {
            assert_eq!(
                node.parent_code.as_deref(),
                parent_code_of(&node.code),
                "parent of {}",
                node.code
            );
            assert_eq!(node.depth, depth_of(&node.code), "depth of {}", node.code);
            if let Some(parent) = &node.parent_code {
                assert!(tree.get(parent).is_some(), "parent {parent} missing");
            }
        }
    }

    #[test]
    fn annex_three_levels() {
        let doc = parse_sections(ANNEX_IV);
        let codes: Vec<&str> = doc.tree.nodes().iter().map(|n| n.code.as_str()).collect();
        assert_eq!(
            codes,
            [
                "AnnexIV",
                "AnnexIV.1",
                "AnnexIV.1.a",
                "AnnexIV.1.b",
                "AnnexIV.2",
                "AnnexIV.2.a"
            ]
        );
        let a = doc.tree.get("AnnexIV.1.a").unwrap();
        assert_eq!(a.parent_code.as_deref(), Some("AnnexIV.1"));
        assert_eq!(a.depth, 2);
        assert_eq!(a.text, "Name and contact details of the provider;");
        assert!(doc.warnings.is_empty());
    }

    #[test]
    fn minimal_annex_scenario() {
        let doc = parse_sections("ANNEX IV\n1. General information\n(a) Name and contact details");
        let codes: Vec<&str> = doc.tree.nodes().iter().map(|n| n.code.as_str()).collect();
        assert_eq!(codes, ["AnnexIV", "AnnexIV.1", "AnnexIV.1.a"]);
        assert_eq!(
            doc.tree.get("AnnexIV.1.a").unwrap().parent_code.as_deref(),
            Some("AnnexIV.1")
        );
    }

    #[test]
    fn root_title_from_next_line() {
        let doc = parse_sections(ANNEX_IV);
        let root = doc.tree.get("AnnexIV").unwrap();
        assert_eq!(root.title, "Technical documentation referred to in Article 11(1)");
        assert_eq!(root.text, "");
    }

    #[test]
    fn article_title_inline() {
        let doc = parse_sections(
            "Article 9 — Risk management system\n1. A risk management system shall be established.\n",
        );
        let root = doc.tree.get("Article9").unwrap();
        assert_eq!(root.title, "Risk management system");
        assert_eq!(
            doc.tree.get("Article9.1").unwrap().text,
            "A risk management system shall be established."
        );
    }

    #[test]
    fn own_text_excludes_children() {
        let doc = parse_sections(ANNEX_IV);
        let one = doc.tree.get("AnnexIV.1").unwrap();
        assert_eq!(one.text, "General information\nThe technical documentation shall contain:");
        assert!(!one.text.contains("Name and contact"));
    }

    #[test]
    fn multiple_roots_close_previous() {
        let doc = parse_sections(
            "Article 9\nRisk management\n1. First.\nArticle 10\nData governance\n1. Second.",
        );
        assert_eq!(doc.tree.get("Article9.1").unwrap().text, "First.");
        assert_eq!(doc.tree.get("Article10.1").unwrap().text, "Second.");
        assert_eq!(doc.tree.roots().count(), 2);
    }

    #[test]
    fn article_letter_suffix_lowercased() {
        let doc = parse_sections("Article 10A\nTitle\n1. Text.");
        assert!(doc.tree.get("Article10a").is_some());
        assert!(doc.tree.get("Article10a.1").is_some());
    }

    #[test]
    fn lettered_under_root_warns_and_attaches() {
        let doc = parse_sections("Article 5\nProhibited practices\n(a) subliminal techniques\n(b) exploitation");
        let a = doc.tree.get("Article5.a").unwrap();
        assert_eq!(a.parent_code.as_deref(), Some("Article5"));
        assert_eq!(a.depth, 1);
        // (b) must be a sibling of (a), not its child.
        assert_eq!(
            doc.tree.get("Article5.b").unwrap().parent_code.as_deref(),
            Some("Article5")
        );
        assert_eq!(doc.warnings.len(), 2);
        assert!(matches!(
            &doc.warnings[0],
            ParseWarning::UnexpectedDepth { code, parent_code, line: 3 }
                if code == "Article5.a" && parent_code == "Article5"
        ));
        assert_hierarchy(&doc.tree);
    }

    #[test]
    fn orphan_marker_goes_to_preamble() {
        let doc = parse_sections("Preamble text\n1. Whereas clause\nArticle 1\nSubject matter");
        assert!(matches!(doc.warnings[0], ParseWarning::OrphanMarker { line: 2, .. }));
        assert!(doc.preamble.contains("Whereas clause"));
        assert_eq!(doc.tree.len(), 1);
    }

    #[test]
    fn duplicate_code_appends() {
        let doc = parse_sections("Article 3\nDefinitions\n1. first\n1. again");
        assert_eq!(doc.tree.get("Article3.1").unwrap().text, "first\nagain");
        assert!(matches!(doc.warnings[0], ParseWarning::DuplicateCode { line: 4, .. }));
    }

    #[test]
    fn decimals_are_not_markers() {
        let doc = parse_sections("Article 1\nScope\n1. Applies to\n1.5 million users");
        assert_eq!(doc.tree.len(), 2);
        assert_eq!(doc.tree.get("Article1.1").unwrap().text, "Applies to\n1.5 million users");
    }

    #[test]
    fn blank_runs_collapsed() {
        let doc = parse_sections("Article 1\nScope\n1. one\n\n\n\n\ntwo");
        assert_eq!(doc.tree.get("Article1.1").unwrap().text, "one\n\ntwo");
    }

    #[test]
    fn empty_document() {
        let doc = parse_sections("");
        assert!(doc.tree.is_empty());
        assert!(doc.warnings.is_empty());
    }

    #[test]
    fn flatten_rebuild_roundtrip() {
        let doc = parse_sections(ANNEX_IV);
        let rebuilt = SectionTree::from_flat(doc.tree.flatten()).unwrap();
        assert_eq!(rebuilt.len(), doc.tree.len());
        for node in doc.tree.nodes() {
            let other = rebuilt.get(&node.code).unwrap();
            assert_eq!(other.parent_code, node.parent_code);
            assert_eq!(other.depth, node.depth);
            assert_eq!(other.text, node.text);
            let mut a: Vec<_> = doc.tree.children(&node.code).map(|c| &c.code).collect();
            let mut b: Vec<_> = rebuilt.children(&node.code).map(|c| &c.code).collect();
            a.sort();
            b.sort();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn entries_roundtrip_preserves_order() {
        let doc = parse_sections(ANNEX_IV);
        let rebuilt = SectionTree::from_flat(doc.tree.entries()).unwrap();
        let a: Vec<_> = doc.tree.nodes().iter().map(|n| (&n.code, &n.parent_code)).collect();
        let b: Vec<_> = rebuilt.nodes().iter().map(|n| (&n.code, &n.parent_code)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn from_flat_rejects_missing_parent() {
        let err = SectionTree::from_flat([("AnnexIV", ""), ("AnnexIV.1.a", "x")]).unwrap_err();
        assert_eq!(
            err,
            SectionError::MissingParent {
                code: "AnnexIV.1.a".into(),
                parent_code: "AnnexIV.1".into()
            }
        );
    }

    #[test]
    fn from_flat_rejects_duplicates() {
        let err = SectionTree::from_flat([("Article1", ""), ("Article1", "x")]).unwrap_err();
        assert_eq!(err, SectionError::DuplicateCode("Article1".into()));
    }

    #[test]
    fn parent_code_of_strips_last_component() {
        assert_eq!(parent_code_of("AnnexIV.1.a"), Some("AnnexIV.1"));
        assert_eq!(parent_code_of("AnnexIV.1"), Some("AnnexIV"));
        assert_eq!(parent_code_of("Article9"), None);
    }

    fn marker_line() -> impl Strategy<Value = String> {
        prop_oneof![
            (1u32..20).prop_map(|n| format!("Article {n}")),
            prop::sample::select(vec!["ANNEX I", "ANNEX IV", "ANNEX XII"]).prop_map(str::to_string),
            (1u32..9).prop_map(|n| format!("{n}. paragraph text")),
            prop::sample::select(vec!['a', 'b', 'c', 'd']).prop_map(|c| format!("({c}) point text")),
            "[A-Za-z ,;]{0,30}".prop_map(|s| s),
        ]
    }

    proptest! {
        #[test]
        fn hierarchy_invariant_holds(lines in prop::collection::vec(marker_line(), 0..40)) {
            let doc = parse_sections(&lines.join("\n"));
            for node in doc.tree.nodes() {
                prop_assert_eq!(node.parent_code.as_deref(), parent_code_of(&node.code));
                prop_assert_eq!(node.depth, depth_of(&node.code));
            }
            let rebuilt = SectionTree::from_flat(doc.tree.flatten()).unwrap();
            prop_assert_eq!(rebuilt.len(), doc.tree.len());
        }
    }
}
