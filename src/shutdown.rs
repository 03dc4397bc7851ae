//! Root cancellation for the dispatch pipeline.
//!
//! A single [`Shutdown`] handle is cloned into every task. Any clone can
//! trigger the teardown; every task observing it drops its in-flight work
//! and exits. The dispatcher's reader triggers it on driver EOF, the
//! binary triggers it on SIGINT.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable cancellation handle shared by every pipeline task.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Begin teardown. Idempotent; wakes every waiter.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// True once teardown has been triggered.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when teardown is triggered. Safe to race against channel
    /// receives in `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for only errs when the sender is gone, which we treat the
        // same as a trigger.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
