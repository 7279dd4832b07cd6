//! Text normalisation and content hashing.
//!
//! Regulatory text reaches us through very different channels (SPARQL
//! literals, feed bodies, scraped HTML) and the same article can come back
//! with different line wrapping on every fetch. Hashes are therefore taken
//! over a whitespace-normalised form so that re-wrapping is not a change.

use sha2::{Digest, Sha256};

/// Collapse every run of whitespace into a single space and trim the ends.
///
/// "Providers  shall\n maintain " → "Providers shall maintain"
pub fn normalize_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Lowercase hex SHA-256 of [`normalize_text`].
pub fn content_hash(s: &str) -> String {
    let digest = Sha256::digest(normalize_text(s).as_bytes());
    format!("{digest:x}")
}

/// Normalise a document before section parsing: unify line endings, replace
/// non-breaking spaces, and strip trailing whitespace per line. Line
/// structure is preserved because section markers are line-anchored.
pub fn normalize_document(s: &str) -> String {
    let unified = s.replace("\r\n", "\n").replace('\r', "\n").replace('\u{a0}', " ");
    let mut out = String::with_capacity(unified.len());
    for (i, line) in unified.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(line.trim_end());
    }
    out
}
