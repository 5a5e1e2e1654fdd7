// src/debounce.rs
// Single-fire, resettable debounce timer. Backs both the summarizer's 5s
// enqueue debounce and the dispatcher's 2s knowledge-generation debounce
// (one instance per watched cwd) — spec §4.6.1, §4.7, §9 ("Debouncing").

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Arms a delayed fire that is cancelled and rescheduled by every call to
/// `trigger`. Only the last `trigger` within the window actually runs its
/// callback; a subsequent `cancel` (or pipeline shutdown) suppresses firing
/// entirely.
#[derive(Clone)]
pub struct Debouncer {
    duration: Duration,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// (Re)arm the timer. If another `trigger` or `cancel` happens before
    /// `duration` elapses, this call's `on_fire` never runs.
    pub fn trigger<F, Fut>(&self, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        let duration = self.duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if generation.load(Ordering::SeqCst) == my_generation {
                on_fire().await;
            }
        });
    }

    /// Suppress any pending fire without scheduling a new one.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}
