//! Worker: polls the queue and runs the transform on each pending task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument, debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{Status, TaskDescriptor};
use crate::store::{FailOutcome, QueueStore};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};
use crate::transform::{InvertTransform, Transform};

use super::Shutdown;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub quarantined: usize,
    /// Terminal descriptors whose relocation was finished.
    pub relocated: usize,
    /// Pending tasks that could not be claimed or settled this tick; they
    /// stay visible in the queue for the next one.
    pub skipped: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Worker<C: Clock = SystemClock, T: Transform = InvertTransform> {
    store: QueueStore<C>,
    transform: Arc<T>,
    config: WorkerConfig,
    shutdown: Shutdown,
}

impl<C: Clock, T: Transform> Worker<C, T> {
    pub fn new(store: QueueStore<C>, transform: T, config: WorkerConfig, shutdown: Shutdown) -> Self {
        Self {
            store,
            transform: Arc::new(transform),
            config,
            shutdown,
        }
    }

    pub fn store(&self) -> &QueueStore<C> {
        &self.store
    }

    /// Release claims left by a previous worker process.
    pub fn recover(&self) -> Result<usize> {
        self.store.release_stale_claims()
    }

    /// One poll: reconcile the queue directory, then process every pending
    /// task in `queued_at` order. Per-task errors are logged, never returned.
    pub async fn tick(&self) -> Result<TickReport> {
        let scan = self.store.scan()?;
        let mut report = TickReport::default();

        for corrupt in &scan.corrupt {
            error!(path = %corrupt.path.display(), reason = %corrupt.reason, "corrupt descriptor");
            match self.store.quarantine(&corrupt.path, &corrupt.reason) {
                Ok(_) => report.quarantined += 1,
                Err(e) => error!(path = %corrupt.path.display(), "quarantine failed: {e}"),
            }
        }

        for stranded in &scan.stranded {
            match self.store.finish_relocation(stranded) {
                Ok(()) => report.relocated += 1,
                Err(e) => error!(id = %stranded.id, "could not finish relocation: {e}"),
            }
        }

        for desc in &scan.pending {
            if self.shutdown.is_triggered() {
                break;
            }
            self.process(desc, &mut report).await;
        }

        Ok(report)
    }

    /// Run until shutdown. The task in flight finishes before returning.
    pub async fn run(&self) -> Result<()> {
        let released = self.recover()?;
        if released > 0 {
            warn!(released, "released stale claims");
        }
        info!(
            queue = %self.store.layout().queue.display(),
            interval_secs = self.config.poll_interval.as_secs_f64(),
            "worker started"
        );

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.tick().await {
                Ok(report) if !report.is_idle() => info!(
                    completed = report.completed,
                    retried = report.retried,
                    dead_lettered = report.dead_lettered,
                    quarantined = report.quarantined,
                    relocated = report.relocated,
                    "poll finished"
                ),
                Ok(_) => {}
                Err(e) => error!("error in processing loop: {e}"),
            }

            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = self.store.clock().sleep(self.config.poll_interval) => {}
            }
        }

        info!("worker shutting down");
        Ok(())
    }

    async fn process(&self, desc: &TaskDescriptor, report: &mut TickReport) {
        let claim = match self.store.claim(desc) {
            Ok(claim) => claim,
            Err(Error::NotFound(_)) => {
                debug!(id = %desc.id, "task gone before claim");
                report.skipped += 1;
                return;
            }
            Err(Error::CorruptDescriptor { path, reason }) => {
                if self.store.quarantine(&path, &reason).is_ok() {
                    report.quarantined += 1;
                }
                return;
            }
            Err(e) => {
                warn!(id = %desc.id, "could not claim task: {e}");
                report.skipped += 1;
                return;
            }
        };

        if !claim.payload_path().exists() {
            error!(id = %desc.id, payload = %claim.payload_path().display(), "payload missing for queued task");
            match self.store.quarantine(claim.path(), "payload missing") {
                Ok(_) => report.quarantined += 1,
                Err(e) => {
                    error!(id = %desc.id, "quarantine failed: {e}");
                    if let Err(e) = self.store.unclaim(&desc.id) {
                        error!(id = %desc.id, "could not return claim to queue: {e}");
                    }
                    report.skipped += 1;
                }
            }
            return;
        }

        let span = start_task_span(&desc.id, claim.descriptor().attempts + 1);
        async {
            info!(payload = %claim.descriptor().payload_name, "processing task");

            let input = claim.payload_path().to_path_buf();
            let transform = Arc::clone(&self.transform);
            let started = Instant::now();
            let result = match tokio::task::spawn_blocking(move || transform.transform(&input)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(join) => Err(format!("transform panicked: {join}")),
            };
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            metrics::transform_duration_ms().record(
                elapsed_ms,
                &[KeyValue::new("result", if result.is_ok() { "ok" } else { "error" })],
            );

            match result {
                Ok(output) => {
                    let output_name = output
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default()
                        .to_string();
                    match self.store.complete(claim, &output_name) {
                        Ok(_) => {
                            record_state_transition(&span, Status::Queued, Status::Completed);
                            report.completed += 1;
                        }
                        Err(e) => {
                            error!("could not complete task: {e}");
                            report.skipped += 1;
                        }
                    }
                }
                Err(reason) => {
                    error!(error = %reason, "transform failed");
                    match self.store.fail(claim, &reason) {
                        Ok(FailOutcome::Retrying { .. }) => report.retried += 1,
                        Ok(FailOutcome::DeadLettered(_)) => {
                            record_state_transition(&span, Status::Queued, Status::Failed);
                            report.dead_lettered += 1;
                        }
                        Err(e) => {
                            error!("could not record failure: {e}");
                            report.skipped += 1;
                        }
                    }
                }
            }
        }
        .instrument(span.clone())
        .await;
    }
}
