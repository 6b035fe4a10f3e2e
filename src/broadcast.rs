use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use strum::{AsRefStr, Display};

use crate::history::HistorySnapshot;

const DEFAULT_OBSERVER_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeReason {
    Added,
    Deleted,
    Cleared,
    Restored,
    Imported,
}

#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Updated {
        reason: ChangeReason,
        history: HistorySnapshot,
    },
}

/// Best-effort fan-out of history updates. Each observer owns a bounded
/// queue; an event that does not fit is dropped for that observer only and
/// observers whose receiver is gone are pruned on the next publish.
pub struct Broadcaster {
    observers: Mutex<Vec<Sender<HistoryEvent>>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_OBSERVER_CAPACITY)
    }
}

impl Broadcaster {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<HistoryEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.observers.lock().push(tx);
        rx
    }

    /// Returns how many observers received the event.
    pub fn publish(&self, event: HistoryEvent) -> usize {
        let mut observers = self.observers.lock();
        let mut delivered = 0;
        observers.retain(|observer| match observer.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::trace!("observer queue full, dropping history event");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("pruning disconnected history observer");
                false
            }
        });
        delivered
    }
}
