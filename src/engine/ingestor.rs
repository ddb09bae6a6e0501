//! Ingestor: moves arriving files from the source directory into the queue.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Extensions;
use crate::error::{Error, Result};
use crate::event::FsEvent;
use crate::model::TaskId;
use crate::store::{AdoptReport, QueueStore};

use super::Shutdown;

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub extensions: Extensions,
    /// Wait after an event before touching the file, so the writer can finish.
    pub settle_delay: Duration,
    /// Interval of the safety-net rescan of the source directory.
    pub rescan_interval: Duration,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            extensions: Extensions::default(),
            settle_delay: Duration::from_secs(1),
            rescan_interval: Duration::from_secs(30),
        }
    }
}

/// What happened to one candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued(TaskId),
    /// A live task with the same id exists; the file stays in the source
    /// directory and is offered again by a later rescan.
    AlreadyQueued(TaskId),
    /// The file disappeared before it could be moved.
    Vanished,
    /// Not a recognized payload.
    Ignored,
    Failed(String),
}

pub struct Ingestor<C: Clock = SystemClock> {
    store: QueueStore<C>,
    config: IngestorConfig,
    shutdown: Shutdown,
}

impl<C: Clock> Ingestor<C> {
    pub fn new(store: QueueStore<C>, config: IngestorConfig, shutdown: Shutdown) -> Self {
        Self {
            store,
            config,
            shutdown,
        }
    }

    pub fn store(&self) -> &QueueStore<C> {
        &self.store
    }

    /// Repair what an interrupted enqueue left behind in the queue directory.
    pub fn recover(&self) -> Result<AdoptReport> {
        self.store.adopt_orphan_payloads(&self.config.extensions)
    }

    /// Offer every recognized file already in the source directory, without
    /// settling. Running it twice in a row queues nothing the second time.
    pub fn sweep(&self) -> Result<Vec<IngestOutcome>> {
        let candidates = self.candidates(None)?;
        Ok(candidates.iter().map(|p| self.offer(p)).collect())
    }

    /// Like [`sweep`](Self::sweep), but skips files modified within the
    /// settling delay, which an in-flight event will pick up.
    pub fn rescan(&self) -> Result<Vec<IngestOutcome>> {
        let cutoff = self
            .store
            .clock()
            .now()
            .checked_sub_signed(to_chrono(self.config.settle_delay))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let candidates = self.candidates(Some(cutoff))?;
        let outcomes: Vec<_> = candidates.iter().map(|p| self.offer(p)).collect();

        match self.store.counts() {
            Ok(counts) => debug!(queued = counts.queued, claimed = counts.claimed, "queue depth"),
            Err(e) => warn!("could not count queue: {e}"),
        }
        Ok(outcomes)
    }

    /// Settle, then offer the file named by one change event.
    pub async fn handle_event(&self, event: FsEvent) -> IngestOutcome {
        if !self.recognized(&event.path) {
            return IngestOutcome::Ignored;
        }
        info!(kind = ?event.kind, file = %event.path.display(), "new image detected");

        self.store.clock().sleep(self.config.settle_delay).await;

        if !event.path.exists() {
            warn!(file = %event.path.display(), "file no longer exists");
            return IngestOutcome::Vanished;
        }
        if !event.path.is_file() {
            return IngestOutcome::Ignored;
        }
        self.offer(&event.path)
    }

    /// Run until shutdown: recover, sweep, then serve events and periodic
    /// rescans. A closed event stream leaves the rescans running.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<FsEvent>) -> Result<()> {
        let source = &self.store.layout().source;
        if !source.is_dir() {
            return Err(Error::Config(format!(
                "source directory {} is not accessible",
                source.display()
            )));
        }

        let report = self.recover()?;
        if !report.adopted.is_empty() || report.temp_removed > 0 {
            info!(
                adopted = report.adopted.len(),
                temp_removed = report.temp_removed,
                "recovered interrupted enqueues"
            );
        }

        let swept = self.sweep()?;
        info!(
            dir = %source.display(),
            queued = count_queued(&swept),
            "ingestor started"
        );

        let clock = self.store.clock();
        let mut watching = true;
        let mut next_rescan = after(clock.now(), self.config.rescan_interval);

        loop {
            let until_rescan = (next_rescan - clock.now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    info!("ingestor shutting down");
                    return Ok(());
                }
                event = events.recv(), if watching => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => {
                        warn!("event stream closed, continuing with rescans only");
                        watching = false;
                    }
                },
                _ = clock.sleep(until_rescan) => {
                    match self.rescan() {
                        Ok(outcomes) => {
                            let queued = count_queued(&outcomes);
                            if queued > 0 {
                                info!(queued, "rescan picked up files");
                            }
                        }
                        Err(e) => error!("rescan failed: {e}"),
                    }
                    next_rescan = after(clock.now(), self.config.rescan_interval);
                }
            }
        }
    }

    // -----------------------------------------------------------------------

    fn offer(&self, path: &Path) -> IngestOutcome {
        match self.store.enqueue(path) {
            Ok(desc) => IngestOutcome::Queued(desc.id),
            Err(Error::AlreadyQueued(id)) => {
                info!(id = %id, file = %path.display(), "task already queued, leaving file for a later pass");
                IngestOutcome::AlreadyQueued(id)
            }
            Err(Error::NotFound(_)) => {
                warn!(file = %path.display(), "file no longer exists");
                IngestOutcome::Vanished
            }
            Err(e) => {
                error!(file = %path.display(), "error queueing image: {e}");
                IngestOutcome::Failed(e.to_string())
            }
        }
    }

    fn recognized(&self, path: &Path) -> bool {
        let visible = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.'));
        visible && self.config.extensions.matches(path)
    }

    /// Recognized regular files in the source directory, sorted by name.
    /// With a cutoff, files modified after it are skipped.
    fn candidates(&self, cutoff: Option<DateTime<Utc>>) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.store.layout().source)? {
            let entry = entry?;
            let path = entry.path();
            if !self.recognized(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            if let Some(cutoff) = cutoff {
                let modified: DateTime<Utc> = match meta.modified() {
                    Ok(t) => t.into(),
                    Err(_) => continue,
                };
                if modified > cutoff {
                    continue;
                }
            }
            paths.push(path);
        }
        paths.sort();
        Ok(paths)
    }
}

fn count_queued(outcomes: &[IngestOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Queued(_)))
        .count()
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
