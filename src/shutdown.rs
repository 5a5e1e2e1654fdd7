// src/shutdown.rs
// Crate-level shutdown signal, shared by an embedding process and the
// pipeline's own components — spec §4.6 "Graceful shutdown". Mirrors the
// reference server's `HeartbeatManager` stop channel: a `watch<bool>` that
// starts `false` and is flipped exactly once.

use tokio::sync::watch;

/// A broadcastable "please wind down" signal. Cloning shares the same
/// underlying channel; any clone can signal, any clone can wait.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request shutdown. Idempotent — firing it twice is a no-op the second
    /// time.
    pub fn request(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.tx.subscribe().borrow()
    }

    /// A fresh receiver for this signal, for use in a `tokio::select!` arm
    /// alongside other work.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once shutdown has been requested; resolves immediately if it
    /// already has been.
    pub async fn recv(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
