use regex::Regex;

use crate::config::SearchOptions;
use crate::history::Entry;

const SUBSTRING_WEIGHT: usize = 10;
const WORD_START_WEIGHT: usize = 5;

/// Ranks history entries against free-text queries. Nothing is indexed ahead
/// of time; every query scans the snapshot it is given.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    min_query_length: usize,
    max_results: usize,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new(&SearchOptions::default())
    }
}

impl SearchIndex {
    pub fn new(options: &SearchOptions) -> Self {
        Self {
            min_query_length: options.min_query_length,
            max_results: options.max_results,
        }
    }

    pub fn query(&self, query: &str, history: &[Entry]) -> Vec<Entry> {
        if query.trim().chars().count() < self.min_query_length {
            return history.to_vec();
        }
        let terms = parse_terms(query);
        if terms.is_empty() {
            return history.to_vec();
        }

        let mut scored: Vec<(usize, &Entry)> = history
            .iter()
            .filter_map(|entry| {
                relevance_score(&terms, &entry.text.to_lowercase()).map(|score| (score, entry))
            })
            .collect();

        // `sort_by` is stable, so equal scores keep history order.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let limit = match self.max_results {
            0 => usize::MAX,
            n => n,
        };
        scored
            .into_iter()
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

pub fn search(query: &str, history: &[Entry]) -> Vec<Entry> {
    SearchIndex::default().query(query, history)
}

/// `None` when `haystack` (already lowercased) misses any term.
fn relevance_score(terms: &[Term], haystack: &str) -> Option<usize> {
    if !terms.iter().all(|term| haystack.contains(term.text.as_str())) {
        return None;
    }
    Some(terms.iter().map(|term| term.score(haystack)).sum())
}

struct Term {
    text: String,
    word_start: Option<Regex>,
}

impl Term {
    fn score(&self, haystack: &str) -> usize {
        let substring = haystack.matches(self.text.as_str()).count();
        let word_starts = self
            .word_start
            .as_ref()
            .map(|re| re.find_iter(haystack).count())
            .unwrap_or(0);
        SUBSTRING_WEIGHT * substring + WORD_START_WEIGHT * word_starts
    }
}

fn parse_terms(query: &str) -> Vec<Term> {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .map(|text| {
            let word_start = Regex::new(&format!(r"\b{}", regex::escape(&text)))
                .map_err(|err| tracing::warn!(?err, term = %text, "skipping word-start scoring"))
                .ok();
            Term { text, word_start }
        })
        .collect()
}
