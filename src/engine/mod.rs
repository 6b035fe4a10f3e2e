use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use serde_json::Value;

use crate::broadcast::{Broadcaster, HistoryEvent};
use crate::cache::{CacheStats, ReadCache};
use crate::config::AppConfig;
use crate::history::{Entry, ExportBundle, HistorySnapshot, HistoryStore};
use crate::intake::{CandidateOutcome, IntakeDebouncer, IntakeEvent};
use crate::search::SearchIndex;
use crate::storage::KeyValueStore;

mod api;

pub use api::{Request, Response};

/// Wires the history components together and answers the request/response
/// contract used by every front end.
pub struct Engine {
    store: Arc<HistoryStore>,
    cache: Arc<ReadCache>,
    search: SearchIndex,
    intake: Mutex<IntakeDebouncer>,
    broadcaster: Arc<Broadcaster>,
    persistence: Arc<dyn KeyValueStore>,
}

impl Engine {
    pub fn new(config: &AppConfig, persistence: Arc<dyn KeyValueStore>) -> Result<Self> {
        let broadcaster = Arc::new(Broadcaster::default());
        let cache = Arc::new(ReadCache::new(config.cache.ttl));
        let store = HistoryStore::open(
            &config.history,
            &config.display,
            Arc::clone(&persistence),
            Arc::clone(&broadcaster),
        )
        .context("opening history store")?
        .with_cache(Arc::clone(&cache));
        let store = Arc::new(store);
        let intake = IntakeDebouncer::new(
            &config.intake,
            config.history.min_text_length,
            store.clone(),
            Arc::clone(&persistence),
        );
        Ok(Self {
            store,
            cache,
            search: SearchIndex::new(&config.search),
            intake: Mutex::new(intake),
            broadcaster,
            persistence,
        })
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Current history, served from the read cache when it is warm.
    pub fn history(&self) -> HistorySnapshot {
        self.cache.get(|| self.store.snapshot())
    }

    pub fn search(&self, query: &str) -> Vec<Entry> {
        self.search.query(query, &self.history())
    }

    pub fn export(&self) -> ExportBundle {
        self.store.export()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Background persistence writes that failed since startup.
    pub fn persistence_failures(&self) -> usize {
        self.persistence.failed_writes()
    }

    pub fn subscribe(&self) -> Receiver<HistoryEvent> {
        self.broadcaster.subscribe()
    }

    pub fn on_candidate(&self, text: &str) -> CandidateOutcome {
        self.intake.lock().on_candidate(text)
    }

    pub fn on_candidate_at(&self, text: &str, now: Instant) -> CandidateOutcome {
        self.intake.lock().on_candidate_at(text, now)
    }

    /// Forwards a debounced candidate if one became due.
    pub fn tick(&self) -> Option<IntakeEvent> {
        self.intake.lock().poll()
    }

    pub fn tick_at(&self, now: Instant) -> Option<IntakeEvent> {
        self.intake.lock().poll_at(now)
    }

    pub fn flush_intake(&self) -> Option<IntakeEvent> {
        self.intake.lock().flush()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.intake.lock().next_deadline()
    }

    pub fn detection_enabled(&self) -> bool {
        self.intake.lock().is_enabled()
    }

    pub fn toggle_detection(&self) -> bool {
        self.intake.lock().toggle()
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Add { text } => Response::ack(self.store.add(&text)),
            Request::GetHistory => {
                let history = self.history().to_vec();
                Response::History {
                    count: history.len(),
                    history,
                }
            }
            Request::DeleteItem { id } => Response::ack(self.store.delete_by_id(&id)),
            Request::Clear => {
                self.store.clear();
                Response::ack(true)
            }
            Request::Restore => Response::ack(self.store.restore()),
            Request::Search { query } => Response::Matches {
                history: self.search(&query),
            },
            Request::ToggleDetection => Response::Detection {
                enabled: self.toggle_detection(),
            },
            Request::Export => Response::Export {
                data: self.export(),
            },
            Request::Import { data } => self.import(data),
            Request::Unknown => Response::failure("unknown action"),
        }
    }

    /// Parses and answers one JSON request. Malformed input becomes a
    /// failure response.
    pub fn handle_json(&self, raw: &str) -> Response {
        match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.handle(request),
            Err(err) => {
                tracing::debug!(?err, "rejecting malformed request");
                Response::failure(format!("invalid request: {err}"))
            }
        }
    }

    fn import(&self, data: Value) -> Response {
        let Value::Array(items) = data else {
            return Response::failure("import data must be a list of entries");
        };
        let entries: Vec<Entry> = items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<Entry>(item) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(?err, "skipping malformed imported entry");
                    None
                }
            })
            .collect();
        let count = self.store.import_all(entries);
        Response::Imported {
            success: true,
            count,
        }
    }
}
