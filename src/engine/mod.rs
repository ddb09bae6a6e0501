//! The two loops: an ingestor feeding the queue and a worker draining it.
//!
//! They share nothing but the queue directories and may run in one process
//! or two. Both stop when their [`Shutdown`] handle is triggered, after the
//! item in hand is finished.

pub mod ingestor;
pub mod worker;

pub use ingestor::{IngestOutcome, Ingestor, IngestorConfig};
pub use worker::{TickReport, Worker, WorkerConfig};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative stop signal shared by both loops. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    notify: Notify,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every holder to stop. Idempotent.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once `trigger` has been called, including before this call.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}
