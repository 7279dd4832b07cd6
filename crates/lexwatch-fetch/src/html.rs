//! Heuristic body-text extraction from HTML pages.
//!
//! Not a parser: a sequence of regex passes that is good enough for the
//! fairly plain markup of official journals and regulator sites.

use std::sync::LazyLock;

use regex::Regex;

static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static BOILERPLATE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ["script", "style", "noscript", "nav", "header", "footer", "aside", "form"]
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).unwrap())
        .collect()
});

static MAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<main\b[^>]*>(.*)</main\s*>").unwrap());

static ARTICLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<article\b[^>]*>(.*)</article\s*>").unwrap());

static BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<body\b[^>]*>(.*)</body\s*>").unwrap());

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").unwrap());

static BLOCK_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)</?(?:p|div|br|li|ul|ol|h[1-6]|tr|td|th|table|section|article|main|blockquote|pre|dt|dd|hr)\b[^>]*/?>",
    )
    .unwrap()
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(?:[xX]([0-9a-fA-F]+)|([0-9]+));").unwrap());

static SPACE_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());

/// Whether a payload looks like markup rather than plain text.
pub fn looks_like_html(s: &str) -> bool {
    let head = s.trim_start();
    head.starts_with('<') && TAG_RE.is_match(head)
}

/// The document `<title>`, decoded and trimmed.
pub fn extract_title(html: &str) -> Option<String> {
    let raw = TITLE_RE.captures(html)?.get(1)?.as_str();
    let title = collapse_spaces(&decode_entities(&TAG_RE.replace_all(raw, "")));
    (!title.is_empty()).then_some(title)
}

/// Readable body text with one block per line and at most one blank line
/// between blocks.
pub fn extract_text(html: &str) -> String {
    let mut doc = COMMENT_RE.replace_all(html, "").into_owned();
    for re in BOILERPLATE_RES.iter() {
        doc = re.replace_all(&doc, "").into_owned();
    }

    let content = [&*MAIN_RE, &*ARTICLE_RE, &*BODY_RE]
        .iter()
        .find_map(|re| re.captures(&doc).and_then(|c| c.get(1)))
        .map_or(doc.as_str(), |m| m.as_str());

    let blocks = BLOCK_TAG_RE.replace_all(content, "\n");
    let stripped = TAG_RE.replace_all(&blocks, "");
    let decoded = decode_entities(&stripped);

    let mut out = String::with_capacity(decoded.len());
    let mut blank_pending = false;
    for line in decoded.lines() {
        let line = collapse_spaces(line);
        if line.is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if blank_pending {
            out.push('\n');
            blank_pending = false;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line);
    }
    out
}

fn collapse_spaces(s: &str) -> String {
    SPACE_RUN_RE.replace_all(s.trim(), " ").trim().to_string()
}

/// Decode numeric entities and the named ones that matter in practice.
pub fn decode_entities(s: &str) -> String {
    let numeric = NUMERIC_ENTITY_RE.replace_all(s, |c: &regex::Captures<'_>| {
        let code = match (c.get(1), c.get(2)) {
            (Some(hex), _) => u32::from_str_radix(hex.as_str(), 16).ok(),
            (_, Some(dec)) => dec.as_str().parse().ok(),
            _ => None,
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| c[0].to_string())
    });
    numeric
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&ndash;", "–")
        .replace("&mdash;", "—")
        .replace("&sect;", "§")
        // Last, so "&amp;lt;" stays "&lt;".
        .replace("&amp;", "&")
}
