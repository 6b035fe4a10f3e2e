use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::history::HistorySnapshot;

/// Short-lived memo of the current history shared by every reader.
///
/// Each `invalidate` bumps a generation counter, and a snapshot loaded while
/// the generation changed underneath it is handed to its caller but never
/// cached. A mutation can therefore never be hidden behind an older hit.
pub struct ReadCache {
    ttl: Duration,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    cached: Option<Cached>,
    hits: u64,
    misses: u64,
}

struct Cached {
    history: HistorySnapshot,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl ReadCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn get<F>(&self, load: F) -> HistorySnapshot
    where
        F: FnOnce() -> HistorySnapshot,
    {
        self.get_at(Instant::now(), load)
    }

    pub fn get_at<F>(&self, now: Instant, load: F) -> HistorySnapshot
    where
        F: FnOnce() -> HistorySnapshot,
    {
        let generation = {
            let mut slot = self.slot.lock();
            if let Some(cached) = slot.cached.as_ref() {
                if now < cached.expires_at {
                    let history = cached.history.clone();
                    slot.hits += 1;
                    return history;
                }
            }
            slot.cached = None;
            slot.misses += 1;
            slot.generation
        };

        let history = load();

        let mut slot = self.slot.lock();
        if slot.generation == generation {
            slot.cached = Some(Cached {
                history: history.clone(),
                expires_at: now + self.ttl,
            });
        }
        history
    }

    pub fn invalidate(&self) {
        let mut slot = self.slot.lock();
        slot.generation = slot.generation.wrapping_add(1);
        slot.cached = None;
    }

    pub fn stats(&self) -> CacheStats {
        let slot = self.slot.lock();
        CacheStats {
            hits: slot.hits,
            misses: slot.misses,
        }
    }
}
