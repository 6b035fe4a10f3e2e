use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::broadcast::{Broadcaster, ChangeReason, HistoryEvent};
use crate::cache::ReadCache;
use crate::codec::Codec;
use crate::config::{DisplayOptions, HistoryOptions};
use crate::storage::KeyValueStore;

mod entry;

pub use entry::{
    new_entry_id, validate_and_clean, CleanText, Entry, EntryStamp, HistorySnapshot, TextRules,
    TRUNCATION_MARKER,
};

pub const HISTORY_KEY: &str = "copyHistory";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportBundle {
    pub timestamp: String,
    pub count: usize,
    pub items: Vec<Entry>,
}

#[derive(Default)]
struct HistoryState {
    entries: Vec<Entry>,
    backup: Option<Vec<Entry>>,
}

/// Owns the bounded, most-recent-first history and the one-slot backup that
/// makes `clear` undoable. Every mutation runs under one lock: memory first,
/// then a write-through of the whole list, then cache invalidation and the
/// broadcast. Persistence failures are logged and never undo the in-memory
/// change.
pub struct HistoryStore {
    state: Mutex<HistoryState>,
    persistence: Arc<dyn KeyValueStore>,
    broadcaster: Arc<Broadcaster>,
    cache: Option<Arc<ReadCache>>,
    codec: Codec,
    rules: TextRules,
    stamp: EntryStamp,
    max_entries: usize,
}

impl HistoryStore {
    /// Loads the persisted history and returns a ready store.
    pub fn open(
        options: &HistoryOptions,
        display: &DisplayOptions,
        persistence: Arc<dyn KeyValueStore>,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<Self> {
        let stamp = EntryStamp::new(display.date_format()?);
        Ok(Self::with_stamp(options, stamp, persistence, broadcaster))
    }

    pub fn with_stamp(
        options: &HistoryOptions,
        stamp: EntryStamp,
        persistence: Arc<dyn KeyValueStore>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let codec = Codec::new(options.compression_threshold);
        let max_entries = options.max_entries.max(1);
        let rules = TextRules {
            min_length: options.min_text_length,
            max_length: options.max_text_length,
        };
        let entries = load_entries(persistence.as_ref(), &codec, &rules, max_entries);
        tracing::info!(count = entries.len(), "history loaded");
        Self {
            state: Mutex::new(HistoryState {
                entries,
                backup: None,
            }),
            persistence,
            broadcaster,
            cache: None,
            codec,
            rules,
            stamp,
            max_entries,
        }
    }

    /// Cache that every mutation invalidates before broadcasting.
    pub fn with_cache(mut self, cache: Arc<ReadCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn add(&self, raw: &str) -> bool {
        let Some(cleaned) = self.rules.clean(raw) else {
            tracing::debug!("rejected history candidate during cleaning");
            return false;
        };

        let mut state = self.state.lock();
        state.entries.retain(|entry| entry.text != cleaned.text);
        let entry = Entry::create(cleaned, &self.codec, &self.stamp);
        tracing::debug!(
            id = %entry.id,
            compressed = entry.compressed,
            original_length = entry.original_length,
            "adding history entry"
        );
        state.entries.insert(0, entry);
        state.entries.truncate(self.max_entries);
        self.commit(&state, ChangeReason::Added);
        true
    }

    pub fn delete_by_id(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.id != id);
        if state.entries.len() == before {
            return false;
        }
        self.commit(&state, ChangeReason::Deleted);
        true
    }

    /// Moves the whole history into the backup slot, replacing any earlier
    /// backup.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let previous = std::mem::take(&mut state.entries);
        state.backup = Some(previous);
        self.commit(&state, ChangeReason::Cleared);
    }

    pub fn restore(&self) -> bool {
        let mut state = self.state.lock();
        match state.backup.take() {
            Some(backup) if !backup.is_empty() => {
                state.entries = backup;
                self.commit(&state, ChangeReason::Restored);
                true
            }
            _ => false,
        }
    }

    /// Replaces the history with the first entries of `raw`. The backup slot
    /// is left alone.
    pub fn import_all(&self, raw: Vec<Entry>) -> usize {
        let entries = sanitize_entries(raw, &self.codec, &self.rules, self.max_entries);
        let count = entries.len();
        let mut state = self.state.lock();
        state.entries = entries;
        self.commit(&state, ChangeReason::Imported);
        count
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        Arc::from(self.state.lock().entries.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn export(&self) -> ExportBundle {
        let items = self.state.lock().entries.clone();
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        ExportBundle {
            timestamp,
            count: items.len(),
            items,
        }
    }

    fn commit(&self, state: &HistoryState, reason: ChangeReason) {
        match serde_json::to_value(&state.entries) {
            Ok(value) => {
                if let Err(err) = self.persistence.set(HISTORY_KEY, value) {
                    tracing::warn!(?err, %reason, "failed to persist history, keeping in-memory state");
                }
            }
            Err(err) => tracing::warn!(?err, %reason, "failed to serialise history"),
        }
        if let Some(cache) = &self.cache {
            cache.invalidate();
        }
        let history: HistorySnapshot = Arc::from(state.entries.clone());
        self.broadcaster
            .publish(HistoryEvent::Updated { reason, history });
    }
}

fn load_entries(
    persistence: &dyn KeyValueStore,
    codec: &Codec,
    rules: &TextRules,
    max_entries: usize,
) -> Vec<Entry> {
    let value = match persistence.get(HISTORY_KEY) {
        Ok(Some(value)) => value,
        Ok(None) => return Vec::new(),
        Err(err) => {
            tracing::warn!(?err, "failed to read persisted history, starting empty");
            return Vec::new();
        }
    };
    match serde_json::from_value::<Vec<Entry>>(value) {
        Ok(raw) => sanitize_entries(raw, codec, rules, max_entries),
        Err(err) => {
            tracing::warn!(?err, "persisted history is malformed, starting empty");
            Vec::new()
        }
    }
}

/// Cleans loaded or imported entries. Rejected texts and later duplicates are
/// dropped, and a repeated id is replaced with a fresh one.
fn sanitize_entries(
    raw: Vec<Entry>,
    codec: &Codec,
    rules: &TextRules,
    max_entries: usize,
) -> Vec<Entry> {
    let mut seen_texts = HashSet::new();
    let mut seen_ids = HashSet::new();
    raw.into_iter()
        .filter_map(|entry| entry.hydrate(codec, rules))
        .filter(|entry| seen_texts.insert(entry.text.clone()))
        .take(max_entries)
        .map(|mut entry| {
            if !seen_ids.insert(entry.id.clone()) {
                let fresh = new_entry_id();
                tracing::debug!(old = %entry.id, new = %fresh, "reassigning duplicate entry id");
                entry.id = fresh.clone();
                seen_ids.insert(fresh);
            }
            entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use assert_matches::assert_matches;
    use serde_json::json;
    use time::format_description;
    use time::UtcOffset;

    struct Fixture {
        persistence: Arc<MemoryStore>,
        broadcaster: Arc<Broadcaster>,
        store: HistoryStore,
    }

    fn fixture_with(options: HistoryOptions, persistence: Arc<MemoryStore>) -> Fixture {
        let broadcaster = Arc::new(Broadcaster::default());
        let format = format_description::parse_owned::<1>("[year]-[month]-[day]")
            .expect("valid format");
        let store = HistoryStore::with_stamp(
            &options,
            EntryStamp::with_offset(format, UtcOffset::UTC),
            persistence.clone(),
            broadcaster.clone(),
        );
        Fixture {
            persistence,
            broadcaster,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(HistoryOptions::default(), Arc::new(MemoryStore::new()))
    }

    fn texts(store: &HistoryStore) -> Vec<String> {
        store.snapshot().iter().map(|e| e.text.clone()).collect()
    }

    fn persisted_texts(persistence: &MemoryStore) -> Vec<String> {
        let value = persistence
            .get(HISTORY_KEY)
            .expect("readable")
            .unwrap_or_else(|| json!([]));
        serde_json::from_value::<Vec<Entry>>(value)
            .expect("entries")
            .into_iter()
            .map(|e| e.text)
            .collect()
    }

    #[test]
    fn re_adding_text_moves_it_to_the_front() {
        let fx = fixture();
        assert!(fx.store.add("hello world"));
        assert!(fx.store.add("foo bar"));
        assert!(fx.store.add("hello world"));
        assert_eq!(texts(&fx.store), vec!["hello world", "foo bar"]);
        assert_eq!(persisted_texts(&fx.persistence), vec!["hello world", "foo bar"]);
    }

    #[test]
    fn duplicate_detection_uses_cleaned_text() {
        let fx = fixture();
        fx.store.add("hello   world");
        fx.store.add("  hello\nworld ");
        assert_eq!(texts(&fx.store), vec!["hello world"]);
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let fx = fixture();
        for n in 0..11 {
            assert!(fx.store.add(&format!("entry number {n}")));
            assert!(fx.store.len() <= 10);
        }
        let texts = texts(&fx.store);
        assert_eq!(texts.len(), 10);
        assert_eq!(texts[0], "entry number 10");
        assert_eq!(texts[9], "entry number 1");
        assert!(!texts.contains(&"entry number 0".to_string()));
    }

    #[test]
    fn short_text_is_rejected_without_side_effects() {
        let fx = fixture();
        let events = fx.broadcaster.subscribe();
        fx.store.add("hello world");
        let _ = events.try_recv();
        assert!(!fx.store.add("ab"));
        assert_eq!(texts(&fx.store), vec!["hello world"]);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn delete_reports_whether_anything_changed() {
        let fx = fixture();
        fx.store.add("first entry");
        fx.store.add("second entry");
        let events = fx.broadcaster.subscribe();
        let id = fx.store.snapshot()[1].id.clone();

        assert!(!fx.store.delete_by_id("missing"));
        assert!(events.try_recv().is_err());

        assert!(fx.store.delete_by_id(&id));
        assert_eq!(texts(&fx.store), vec!["second entry"]);
        assert_matches!(
            events.try_recv(),
            Ok(HistoryEvent::Updated {
                reason: ChangeReason::Deleted,
                ..
            })
        );
    }

    #[test]
    fn clear_then_restore_reproduces_history() {
        let fx = fixture();
        fx.store.add("alpha one");
        fx.store.add("beta two");
        let before = fx.store.snapshot();

        fx.store.clear();
        assert!(fx.store.is_empty());
        assert!(persisted_texts(&fx.persistence).is_empty());

        assert!(fx.store.restore());
        assert_eq!(fx.store.snapshot(), before);
        assert_eq!(persisted_texts(&fx.persistence), vec!["beta two", "alpha one"]);

        assert!(!fx.store.restore());
        assert_eq!(fx.store.snapshot(), before);
    }

    #[test]
    fn second_restore_after_clear_returns_false_and_keeps_history_empty() {
        let fx = fixture();
        fx.store.add("alpha one");
        fx.store.clear();
        fx.store.clear();
        assert!(!fx.store.restore());
        assert!(fx.store.is_empty());
    }

    #[test]
    fn second_clear_overwrites_backup() {
        let fx = fixture();
        fx.store.add("alpha one");
        fx.store.clear();
        fx.store.add("gamma three");
        fx.store.clear();
        assert!(fx.store.restore());
        assert_eq!(texts(&fx.store), vec!["gamma three"]);
    }

    #[test]
    fn persistence_failure_keeps_memory_state() {
        let persistence = Arc::new(MemoryStore::new());
        persistence.fail_writes(true);
        let fx = fixture_with(HistoryOptions::default(), persistence);
        assert!(fx.store.add("still added"));
        assert_eq!(texts(&fx.store), vec!["still added"]);
        assert!(fx.persistence.is_empty());
    }

    #[test]
    fn history_is_loaded_and_sanitised_on_open() -> anyhow::Result<()> {
        let persistence = Arc::new(MemoryStore::new());
        persistence.set(
            HISTORY_KEY,
            json!([
                {"id": "1", "text": "kept entry"},
                {"id": "2", "text": ""},
                {"id": "3", "text": "kept entry"},
                {"id": "4", "text": "second kept"},
            ]),
        )?;
        let options = HistoryOptions {
            max_entries: 10,
            ..HistoryOptions::default()
        };
        let fx = fixture_with(options, persistence);
        let snapshot = fx.store.snapshot();
        let ids: Vec<_> = snapshot.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "4"]);
        Ok(())
    }

    #[test]
    fn malformed_persisted_history_starts_empty() -> anyhow::Result<()> {
        let persistence = Arc::new(MemoryStore::new());
        persistence.set(HISTORY_KEY, json!({"not": "a list"}))?;
        let fx = fixture_with(HistoryOptions::default(), persistence);
        assert!(fx.store.is_empty());
        Ok(())
    }

    #[test]
    fn import_caps_and_leaves_backup_alone() {
        let fx = fixture();
        fx.store.add("before import");
        fx.store.clear();
        let raw: Vec<Entry> = (0..15)
            .map(|n| {
                serde_json::from_value(json!({"id": format!("i{n}"), "text": format!("imported {n}")}))
                    .expect("entry")
            })
            .collect();
        assert_eq!(fx.store.import_all(raw), 10);
        assert_eq!(texts(&fx.store)[0], "imported 0");
        assert!(fx.store.restore());
        assert_eq!(texts(&fx.store), vec!["before import"]);
    }

    fn raw_entries(items: serde_json::Value) -> Vec<Entry> {
        serde_json::from_value(items).expect("entries")
    }

    #[test]
    fn import_drops_texts_below_minimum_length() {
        let fx = fixture();
        let count = fx
            .store
            .import_all(raw_entries(json!([{"id": "s", "text": "ab"}, {"id": "k", "text": "kept"}])));
        assert_eq!(count, 1);
        assert_eq!(texts(&fx.store), vec!["kept"]);
    }

    #[test]
    fn import_normalises_whitespace_for_later_dedupe() {
        let fx = fixture();
        fx.store
            .import_all(raw_entries(json!([{"id": "p", "text": "  padded   text  "}])));
        assert_eq!(texts(&fx.store), vec!["padded text"]);
        assert!(fx.store.add("padded text"));
        assert_eq!(texts(&fx.store), vec!["padded text"]);
    }

    #[test]
    fn import_truncates_oversized_text() {
        let fx = fixture();
        fx.store
            .import_all(raw_entries(json!([{"id": "big", "text": "z".repeat(20_000)}])));
        let snapshot = fx.store.snapshot();
        assert_eq!(snapshot[0].text.chars().count(), 10_000);
        assert!(snapshot[0].text.ends_with(TRUNCATION_MARKER));
        assert_eq!(snapshot[0].original_length, 20_000);
        assert_eq!(snapshot[0].size, snapshot[0].data.len());
    }

    #[test]
    fn import_reassigns_duplicate_ids() {
        let fx = fixture();
        let count = fx.store.import_all(raw_entries(json!([
            {"id": "dup", "text": "first text"},
            {"id": "dup", "text": "second text"},
        ])));
        assert_eq!(count, 2);
        let snapshot = fx.store.snapshot();
        assert_eq!(snapshot[0].id, "dup");
        assert_ne!(snapshot[1].id, "dup");

        assert!(fx.store.delete_by_id("dup"));
        assert_eq!(texts(&fx.store), vec!["second text"]);
    }

    #[test]
    fn persisted_history_is_cleaned_on_open() -> anyhow::Result<()> {
        let persistence = Arc::new(MemoryStore::new());
        persistence.set(
            HISTORY_KEY,
            json!([
                {"id": "a", "text": " spaced   out "},
                {"id": "a", "text": "no"},
                {"id": "a", "text": "another one"},
            ]),
        )?;
        let fx = fixture_with(HistoryOptions::default(), persistence);
        let snapshot = fx.store.snapshot();
        assert_eq!(texts(&fx.store), vec!["spaced out", "another one"]);
        assert_ne!(snapshot[0].id, snapshot[1].id);
        Ok(())
    }

    #[test]
    fn long_text_is_compressed_but_served_decoded() {
        let fx = fixture();
        let text = "abc".repeat(700);
        assert!(fx.store.add(&text));
        let snapshot = fx.store.snapshot();
        assert!(snapshot[0].compressed);
        assert_eq!(snapshot[0].text, text);
        assert_eq!(snapshot[0].original_length, 2100);

        // A restart decodes the persisted payload back into the same text.
        let reopened = fixture_with(HistoryOptions::default(), fx.persistence.clone());
        assert_eq!(reopened.store.snapshot()[0].text, text);
    }

    #[test]
    fn mutations_invalidate_attached_cache() {
        let fx = fixture();
        let cache = Arc::new(ReadCache::new(std::time::Duration::from_secs(60)));
        let store = fx.store.with_cache(cache.clone());
        let first = cache.get(|| store.snapshot());
        assert!(first.is_empty());
        store.add("fresh entry");
        let second = cache.get(|| store.snapshot());
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn concurrent_adds_respect_bounds_and_uniqueness() {
        let fx = fixture();
        let store = Arc::new(fx.store);
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..25 {
                        store.add(&format!("shared text {}", n % 12));
                        store.add(&format!("worker {worker} text {n}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker finished");
        }
        let snapshot = store.snapshot();
        assert!(snapshot.len() <= 10);
        let unique: HashSet<_> = snapshot.iter().map(|e| e.text.clone()).collect();
        assert_eq!(unique.len(), snapshot.len());
    }

    #[test]
    fn export_lists_current_items() {
        let fx = fixture();
        fx.store.add("exported entry");
        let bundle = fx.store.export();
        assert_eq!(bundle.count, 1);
        assert_eq!(bundle.items[0].text, "exported entry");
        assert!(OffsetDateTime::parse(&bundle.timestamp, &Rfc3339).is_ok());
    }
}
