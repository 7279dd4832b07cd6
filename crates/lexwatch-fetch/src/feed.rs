//! RSS 2.0 / Atom feeds.
//!
//! Each source has a [`FeedCursor`] owned by the fetcher: the newest
//! publication time seen plus a bounded ring of recent entry ids. Only
//! unseen entries become snapshots. A fetch only stages the advance; the
//! cursor moves when the caller commits it after reconciling every
//! snapshot, so a failed run is replayed in full.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lexwatch_core::{RawSnapshot, Source, SourceKind};
use parking_lot::Mutex;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, info, warn};

use crate::html::{decode_entities, extract_text, looks_like_html};
use crate::http::HttpClient;
use crate::{FetchError, Fetcher};

/// Entry ids remembered per source.
pub const CURSOR_CAPACITY: usize = 512;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub id: String,
    pub title: String,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    /// Full content (`content:encoded` or Atom `content`).
    pub content: Option<String>,
    pub summary: Option<String>,
}

impl FeedEntry {
    /// The regulation this entry belongs to.
    pub fn document_key(&self) -> &str {
        self.link.as_deref().unwrap_or(&self.id)
    }
}

/// Per-source progress through a feed.
#[derive(Debug, Clone, Default)]
pub struct FeedCursor {
    newest: Option<DateTime<Utc>>,
    recent: VecDeque<String>,
}

impl FeedCursor {
    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.newest
    }

    pub fn is_seen(&self, entry: &FeedEntry) -> bool {
        if self.recent.iter().any(|id| id == &entry.id) {
            return true;
        }
        // Older than anything already processed: the ring may have evicted it.
        matches!((entry.published, self.newest), (Some(p), Some(n)) if p < n)
    }

    pub fn advance<'a>(&mut self, entries: impl IntoIterator<Item = &'a FeedEntry>) {
        for entry in entries {
            if let Some(p) = entry.published {
                self.newest = Some(self.newest.map_or(p, |n| n.max(p)));
            }
            if !self.recent.iter().any(|id| id == &entry.id) {
                if self.recent.len() == CURSOR_CAPACITY {
                    self.recent.pop_front();
                }
                self.recent.push_back(entry.id.clone());
            }
        }
    }
}

// ── Parsing ──

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase()
}

/// Atom `<link>`: the alternate (or unqualified) link's `href`.
fn atom_link(e: &BytesStart<'_>) -> Result<Option<String>, FetchError> {
    let rel = match e.try_get_attribute("rel")? {
        Some(a) => Some(a.unescape_value()?.into_owned()),
        None => None,
    };
    if rel.as_deref().is_some_and(|r| r != "alternate") {
        return Ok(None);
    }
    Ok(match e.try_get_attribute("href")? {
        Some(a) => Some(a.unescape_value()?.into_owned()),
        None => None,
    })
}

#[derive(Default)]
struct PartialEntry {
    guid: Option<String>,
    title: Option<String>,
    link: Option<String>,
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    content: Option<String>,
    summary: Option<String>,
}

impl PartialEntry {
    fn set(&mut self, field: &str, value: String) {
        let value = value.trim().to_string();
        if value.is_empty() {
            return;
        }
        match field {
            "title" => self.title = Some(value),
            "link" => self.link = Some(value),
            "guid" | "id" => self.guid = Some(value),
            "pubdate" | "published" | "dc:date" => self.published = parse_date(&value),
            "updated" => self.updated = parse_date(&value),
            "content:encoded" | "content" => self.content = Some(value),
            "description" | "summary" => self.summary = Some(value),
            _ => {}
        }
    }

    fn finish(self) -> Option<FeedEntry> {
        let id = self.guid.or_else(|| self.link.clone())?;
        Some(FeedEntry {
            id,
            title: self.title.unwrap_or_default(),
            link: self.link,
            published: self.published.or(self.updated),
            content: self.content,
            summary: self.summary,
        })
    }
}

/// Parse an RSS 2.0 or Atom document into its entries, in document order.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>, FetchError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut saw_root = false;
    let mut current: Option<PartialEntry> = None;
    // Field being captured and the nesting depth inside it.
    let mut capture: Option<(String, usize)> = None;
    let mut buf = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = local_name(&e);
                if matches!(name.as_str(), "rss" | "feed" | "rdf:rdf") {
                    saw_root = true;
                }
                if let Some((_, depth)) = capture.as_mut() {
                    // Nested markup (Atom xhtml content): keep block boundaries.
                    *depth += 1;
                    buf.push('\n');
                } else if name == "item" || name == "entry" {
                    current = Some(PartialEntry::default());
                } else if let Some(entry) = current.as_mut() {
                    if name == "link"
                        && let Some(href) = atom_link(&e)?
                    {
                        entry.link = Some(href);
                    }
                    capture = Some((name, 0));
                    buf.clear();
                }
            }
            Event::Empty(e) => {
                if let Some(entry) = current.as_mut()
                    && capture.is_none()
                    && local_name(&e) == "link"
                    && let Some(href) = atom_link(&e)?
                {
                    entry.link = Some(href);
                }
            }
            Event::Text(t) => {
                if capture.is_some() {
                    // Feeds routinely carry HTML entities XML doesn't know.
                    match t.unescape() {
                        Ok(text) => buf.push_str(&text),
                        Err(_) => buf.push_str(&decode_entities(&String::from_utf8_lossy(&t))),
                    }
                }
            }
            Event::CData(c) => {
                if capture.is_some() {
                    buf.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(e) => {
                if let Some((_, depth)) = capture.as_mut()
                    && *depth > 0
                {
                    *depth -= 1;
                    buf.push('\n');
                } else if let Some((field, _)) = capture.take() {
                    // An Atom link already took its href; keep it.
                    if let Some(entry) = current.as_mut()
                        && !(field == "link" && entry.link.is_some() && buf.trim().is_empty())
                    {
                        entry.set(&field, std::mem::take(&mut buf));
                    }
                } else if matches!(e.name().as_ref(), b"item" | b"entry") {
                    match current.take().and_then(PartialEntry::finish) {
                        Some(entry) => entries.push(entry),
                        None => warn!("skipping feed entry without id or link"),
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(FetchError::Malformed("not an RSS or Atom document".into()));
    }
    Ok(entries)
}

// ── Fetcher ──

pub struct FeedFetcher {
    http: HttpClient,
    cursors: Mutex<HashMap<String, FeedCursor>>,
    /// Entries returned by the last fetch of each source, not yet committed.
    staged: Mutex<HashMap<String, Vec<FeedEntry>>>,
}

impl FeedFetcher {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            cursors: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the cursor for `source_id`.
    pub fn cursor(&self, source_id: &str) -> FeedCursor {
        self.cursors.lock().get(source_id).cloned().unwrap_or_default()
    }

    async fn entry_text(&self, entry: &FeedEntry) -> Result<Option<String>, FetchError> {
        if let Some(content) = &entry.content {
            return Ok(Some(plain(content)));
        }
        if let Some(link) = &entry.link {
            debug!(link = %link, "fetching linked page for feed entry");
            let html = self.http.get_text(link).await?;
            return Ok(Some(extract_text(&html)));
        }
        Ok(entry.summary.as_deref().map(plain))
    }
}

fn plain(s: &str) -> String {
    if looks_like_html(s) {
        extract_text(s)
    } else {
        s.trim().to_string()
    }
}

#[async_trait]
impl Fetcher for FeedFetcher {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    async fn fetch(&self, source: &Source) -> Result<Vec<RawSnapshot>, FetchError> {
        let xml = self.http.get_text(source.url()).await?;
        let entries = parse_feed(&xml)?;

        let cursor = self.cursor(source.id());
        let mut unseen: Vec<&FeedEntry> = entries.iter().filter(|e| !cursor.is_seen(e)).collect();
        unseen.sort_by_key(|e| e.published);

        let mut snapshots = Vec::with_capacity(unseen.len());
        for entry in &unseen {
            let Some(text) = self.entry_text(entry).await? else {
                warn!(source_id = source.id(), entry = %entry.id, "feed entry has no text");
                continue;
            };
            if text.trim().is_empty() {
                warn!(source_id = source.id(), entry = %entry.id, "feed entry text is empty");
                continue;
            }
            let version = entry.published.map(|p| p.to_rfc3339()).unwrap_or_default();
            snapshots.push(RawSnapshot::new(
                source.id(),
                entry.document_key(),
                entry.link.clone().unwrap_or_else(|| source.url().to_string()),
                entry.title.clone(),
                version,
                text,
                Utc::now(),
            ));
        }

        self.staged.lock().insert(
            source.id().to_string(),
            unseen.iter().map(|e| (*e).clone()).collect(),
        );

        info!(
            source_id = source.id(),
            entries = entries.len(),
            count = snapshots.len(),
            "polled feed"
        );
        Ok(snapshots)
    }

    fn commit(&self, source: &Source) {
        let Some(entries) = self.staged.lock().remove(source.id()) else {
            return;
        };
        self.cursors
            .lock()
            .entry(source.id().to_string())
            .or_default()
            .advance(&entries);
        debug!(source_id = source.id(), entries = entries.len(), "feed cursor advanced");
    }
}
