//! Inbound message coalescing.
//!
//! Chat channels produce bursts of short messages that belong together.
//! The debouncer accumulates items per thread key: the first item arms a
//! timer, each further item resets it, and when the window elapses with no
//! new traffic the whole batch is flushed at once. Batch metadata (channel,
//! correlation) comes from the first item.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::comms::InboundMessage;

type FlushFn = Arc<dyn Fn(Vec<InboundMessage>) + Send + Sync>;

struct PendingBatch {
    items: Vec<InboundMessage>,
    /// Bumped on every push; a timer only flushes if its generation is
    /// still current when it fires.
    generation: u64,
}

pub struct Debouncer {
    window: Duration,
    flush: FlushFn,
    batches: Arc<Mutex<HashMap<String, PendingBatch>>>,
}

impl Debouncer {
    pub fn new(window: Duration, flush: FlushFn) -> Self {
        Self {
            window,
            flush,
            batches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Add an item to its thread's batch, resetting the flush timer.
    pub fn push(&self, thread_key: &str, message: InboundMessage) {
        let generation = {
            let mut batches = lock(&self.batches);
            let batch = batches.entry(thread_key.to_string()).or_insert(PendingBatch {
                items: Vec::new(),
                generation: 0,
            });
            batch.items.push(message);
            batch.generation += 1;
            batch.generation
        };

        let window = self.window;
        let key = thread_key.to_string();
        let batches = self.batches.clone();
        let flush = self.flush.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let items = {
                let mut guard = lock(&batches);
                match guard.get(&key) {
                    // A newer push re-armed the timer; let that one flush.
                    Some(batch) if batch.generation != generation => return,
                    Some(_) => guard.remove(&key).map(|b| b.items).unwrap_or_default(),
                    None => return,
                }
            };
            if !items.is_empty() {
                flush(items);
            }
        });
    }

    /// Number of threads with a batch in flight.
    pub fn pending_threads(&self) -> usize {
        lock(&self.batches).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
