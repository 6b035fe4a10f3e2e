use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::IntakeOptions;
use crate::history::HistoryStore;
use crate::storage::KeyValueStore;

pub const DETECTION_KEY: &str = "detectionEnabled";

/// Receiver of candidates that survived debouncing.
pub trait CandidateSink: Send + Sync {
    /// Returns whether the candidate ended up in the history.
    fn accept(&self, text: &str) -> bool;
}

impl CandidateSink for HistoryStore {
    fn accept(&self, text: &str) -> bool {
        self.add(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Detection is switched off.
    Ignored,
    /// Echo of the last forwarded text inside the duplicate window.
    Suppressed,
    Scheduled { due_at: Instant },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeEvent {
    Forwarded { text: String, added: bool },
    /// The candidate was too short once its debounce delay elapsed.
    Dropped { text: String },
}

struct Accepted {
    text: String,
    at: Instant,
}

struct Pending {
    text: String,
    due_at: Instant,
}

/// Turns bursts of raw copy events into single forwarded candidates.
///
/// The debouncer is driven by the caller: `on_candidate` records input and
/// `poll` forwards whatever became due. Timers are plain deadlines, so a
/// superseded candidate can never fire late.
pub struct IntakeDebouncer {
    enabled: bool,
    debounce: Duration,
    duplicate_window: Duration,
    min_length: usize,
    sink: Arc<dyn CandidateSink>,
    prefs: Arc<dyn KeyValueStore>,
    last_accepted: Option<Accepted>,
    pending: Option<Pending>,
}

impl IntakeDebouncer {
    pub fn new(
        options: &IntakeOptions,
        min_length: usize,
        sink: Arc<dyn CandidateSink>,
        prefs: Arc<dyn KeyValueStore>,
    ) -> Self {
        let enabled = match prefs.get(DETECTION_KEY) {
            Ok(Some(Value::Bool(enabled))) => enabled,
            Ok(Some(other)) => {
                tracing::warn!(value = %other, "ignoring non-boolean detection preference");
                options.enabled
            }
            Ok(None) => options.enabled,
            Err(err) => {
                tracing::warn!(?err, "failed to read detection preference");
                options.enabled
            }
        };
        Self {
            enabled,
            debounce: options.debounce,
            duplicate_window: options.duplicate_window,
            min_length,
            sink,
            prefs,
            last_accepted: None,
            pending: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.due_at)
    }

    pub fn on_candidate(&mut self, text: &str) -> CandidateOutcome {
        self.on_candidate_at(text, Instant::now())
    }

    pub fn on_candidate_at(&mut self, text: &str, now: Instant) -> CandidateOutcome {
        if !self.enabled {
            return CandidateOutcome::Ignored;
        }
        let text = text.trim();
        if let Some(last) = &self.last_accepted {
            if last.text == text && now.saturating_duration_since(last.at) < self.duplicate_window
            {
                tracing::debug!("suppressing duplicate copy candidate");
                return CandidateOutcome::Suppressed;
            }
        }
        let due_at = now + self.debounce;
        self.pending = Some(Pending {
            text: text.to_string(),
            due_at,
        });
        CandidateOutcome::Scheduled { due_at }
    }

    pub fn poll(&mut self) -> Option<IntakeEvent> {
        self.poll_at(Instant::now())
    }

    pub fn poll_at(&mut self, now: Instant) -> Option<IntakeEvent> {
        match &self.pending {
            Some(pending) if pending.due_at <= now => self.fire(now),
            _ => None,
        }
    }

    /// Forwards the pending candidate without waiting for its deadline.
    pub fn flush(&mut self) -> Option<IntakeEvent> {
        self.fire(Instant::now())
    }

    pub fn toggle(&mut self) -> bool {
        let enabled = !self.enabled;
        self.set_enabled(enabled);
        enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.pending = None;
        }
        if let Err(err) = self.prefs.set(DETECTION_KEY, Value::Bool(enabled)) {
            tracing::warn!(?err, enabled, "failed to persist detection preference");
        }
        tracing::info!(enabled, "copy detection toggled");
    }

    fn fire(&mut self, now: Instant) -> Option<IntakeEvent> {
        let Pending { text, .. } = self.pending.take()?;
        if text.chars().count() < self.min_length {
            tracing::debug!("dropping short copy candidate");
            return Some(IntakeEvent::Dropped { text });
        }
        let added = self.sink.accept(&text);
        tracing::debug!(added, "forwarded copy candidate");
        self.last_accepted = Some(Accepted {
            text: text.clone(),
            at: now,
        });
        Some(IntakeEvent::Forwarded { text, added })
    }
}
