use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::format_description::OwnedFormatItem;
use time::{OffsetDateTime, UtcOffset};
use unicode_segmentation::UnicodeSegmentation;

use crate::codec::Codec;

pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Immutable, cheaply clonable view of the history, most recent first.
pub type HistorySnapshot = Arc<[Entry]>;

static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub original_length: usize,
    #[serde(default, alias = "timestamp")]
    pub created_at: i64,
    #[serde(default, alias = "dateString")]
    pub display_date: String,
    #[serde(default)]
    pub size: usize,
}

impl Entry {
    /// Builds a fresh entry for already cleaned text.
    pub fn create(cleaned: CleanText, codec: &Codec, stamp: &EntryStamp) -> Self {
        let encoded = codec.encode(&cleaned.text);
        let now = stamp.now();
        Self {
            id: new_entry_id(),
            size: encoded.data.len(),
            text: cleaned.text,
            compressed: encoded.compressed,
            data: encoded.data,
            original_length: cleaned.original_length,
            created_at: unix_millis(now),
            display_date: stamp.format(now),
        }
    }

    /// Repairs an entry that came from persistence or an import. `text` is
    /// rebuilt from the stored payload when missing, then cleaned with the
    /// same rules `add` applies. Entries the rules reject are discarded.
    pub fn hydrate(mut self, codec: &Codec, rules: &TextRules) -> Option<Self> {
        if self.text.trim().is_empty() && !self.data.is_empty() {
            self.text = codec.decode_or_raw(&self.data, self.compressed);
        }
        let cleaned = rules.clean(&self.text)?;
        if cleaned.text != self.text || self.data.is_empty() {
            let encoded = codec.encode(&cleaned.text);
            self.text = cleaned.text;
            self.compressed = encoded.compressed;
            self.data = encoded.data;
            self.original_length = cleaned.original_length;
        }
        if self.id.is_empty() {
            self.id = new_entry_id();
        }
        if self.original_length == 0 {
            self.original_length = cleaned.original_length;
        }
        self.size = self.data.len();
        Some(self)
    }
}

pub fn new_entry_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Clock plus display format used to stamp new entries. The local offset is
/// resolved once, so display dates reflect the offset at creation time.
#[derive(Debug, Clone)]
pub struct EntryStamp {
    offset: UtcOffset,
    format: OwnedFormatItem,
}

impl EntryStamp {
    pub fn new(format: OwnedFormatItem) -> Self {
        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        Self { offset, format }
    }

    pub fn with_offset(format: OwnedFormatItem, offset: UtcOffset) -> Self {
        Self { offset, format }
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    pub fn format(&self, at: OffsetDateTime) -> String {
        at.format(&self.format).unwrap_or_else(|err| {
            tracing::warn!(?err, "failed to format entry date");
            at.unix_timestamp().to_string()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanText {
    pub text: String,
    /// Character count after whitespace normalisation, before truncation
    pub original_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRules {
    pub min_length: usize,
    pub max_length: usize,
}

impl Default for TextRules {
    fn default() -> Self {
        Self {
            min_length: 3,
            max_length: 10_000,
        }
    }
}

impl TextRules {
    /// Collapses whitespace runs, trims, truncates and enforces the minimum
    /// length. `None` means the input is not worth keeping.
    pub fn clean(&self, raw: &str) -> Option<CleanText> {
        if raw.is_empty() {
            return None;
        }
        let collapsed = WHITESPACE_RUN.replace_all(raw, " ");
        let trimmed = collapsed.trim();
        let original_length = trimmed.chars().count();

        let text = if original_length > self.max_length {
            truncate(trimmed, self.max_length)
        } else {
            trimmed.to_string()
        };

        if text.chars().count() < self.min_length {
            return None;
        }
        Some(CleanText {
            text,
            original_length,
        })
    }
}

pub fn validate_and_clean(raw: &str, rules: &TextRules) -> Option<String> {
    rules.clean(raw).map(|clean| clean.text)
}

/// Cuts on grapheme boundaries and appends the marker. The result stays
/// within `max_chars` as long as the limit is longer than the marker, which
/// the config loader enforces.
fn truncate(text: &str, max_chars: usize) -> String {
    let budget = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let marker = TRUNCATION_MARKER;

    let mut out = String::with_capacity(text.len().min(budget * 4) + marker.len());
    let mut used = 0;
    for grapheme in text.graphemes(true) {
        let width = grapheme.chars().count();
        if used + width > budget {
            break;
        }
        out.push_str(grapheme);
        used += width;
    }
    let kept = out.trim_end().len();
    out.truncate(kept);
    out.push_str(marker);
    out
}
