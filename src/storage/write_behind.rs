use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Sender};
use serde_json::Value;

use super::{KeyValueStore, PersistenceError};

enum Command {
    Write { key: String, value: Value },
    Flush(Sender<()>),
}

/// Applies writes to the wrapped store on a background thread, in order.
/// Callers see `set` return as soon as the write is queued; failures are
/// logged and counted, never reported back.
pub struct WriteBehindStore {
    inner: Arc<dyn KeyValueStore>,
    tx: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    failed_writes: Arc<AtomicUsize>,
}

impl WriteBehindStore {
    pub fn spawn(inner: Arc<dyn KeyValueStore>) -> Result<Self> {
        let (tx, rx) = unbounded::<Command>();
        let failed_writes = Arc::new(AtomicUsize::new(0));
        let worker_store = Arc::clone(&inner);
        let worker_failures = Arc::clone(&failed_writes);
        let worker = thread::Builder::new()
            .name("copyboard-writer".into())
            .spawn(move || {
                for command in rx {
                    match command {
                        Command::Write { key, value } => {
                            if let Err(err) = worker_store.set(&key, value) {
                                worker_failures.fetch_add(1, Ordering::SeqCst);
                                tracing::warn!(?err, %key, "write-behind persistence failed");
                            }
                        }
                        Command::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .context("spawning persistence writer thread")?;
        Ok(Self {
            inner,
            tx: Some(tx),
            worker: Some(worker),
            failed_writes,
        })
    }

    /// Blocks until every write queued before this call has been applied.
    pub fn flush(&self) -> Result<(), PersistenceError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.send(Command::Flush(ack_tx))?;
        ack_rx
            .recv()
            .map_err(|_| PersistenceError::Unavailable("persistence writer stopped".into()))
    }

    fn send(&self, command: Command) -> Result<(), PersistenceError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(PersistenceError::Unavailable(
                "persistence writer stopped".into(),
            ));
        };
        tx.send(command)
            .map_err(|_| PersistenceError::Unavailable("persistence writer stopped".into()))
    }
}

impl KeyValueStore for WriteBehindStore {
    fn get(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        self.flush()?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        self.send(Command::Write {
            key: key.to_string(),
            value,
        })
    }

    fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::SeqCst)
    }
}

impl Drop for WriteBehindStore {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("persistence writer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[test]
    fn writes_are_visible_after_flush() -> anyhow::Result<()> {
        let memory = Arc::new(MemoryStore::new());
        let store = WriteBehindStore::spawn(memory.clone())?;
        for n in 0..50 {
            store.set("counter", json!(n))?;
        }
        store.flush()?;
        assert_eq!(memory.get("counter")?, Some(json!(49)));
        Ok(())
    }

    #[test]
    fn get_observes_queued_writes() -> anyhow::Result<()> {
        let store = WriteBehindStore::spawn(Arc::new(MemoryStore::new()))?;
        store.set("detectionEnabled", json!(false))?;
        assert_eq!(store.get("detectionEnabled")?, Some(json!(false)));
        Ok(())
    }

    #[test]
    fn failures_are_counted_not_returned() -> anyhow::Result<()> {
        let memory = Arc::new(MemoryStore::new());
        memory.fail_writes(true);
        let store = WriteBehindStore::spawn(memory.clone())?;
        store.set("copyHistory", json!([]))?;
        store.flush()?;
        assert_eq!(store.failed_writes(), 1);
        assert!(memory.is_empty());
        Ok(())
    }

    #[test]
    fn drop_drains_pending_writes() -> anyhow::Result<()> {
        let memory = Arc::new(MemoryStore::new());
        {
            let store = WriteBehindStore::spawn(memory.clone())?;
            store.set("copyHistory", json!(["last"]))?;
        }
        assert_eq!(memory.get("copyHistory")?, Some(json!(["last"])));
        Ok(())
    }
}
