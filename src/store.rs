//! Filesystem queue store.
//!
//! The queue directory is the single source of truth. A live task is a pair:
//! the payload file and its `{id}.task` descriptor. Every multi-step
//! transition is an ordered sequence of renames in which the descriptor moves
//! last, so the descriptor's location is what makes a step visible:
//!
//! - enqueue: payload into the queue, then the descriptor (written under a
//!   temporary name and renamed into place)
//! - claim: `{id}.task` -> `{id}.task.claimed`
//! - complete / dead-letter: append terminal lines, move the payload, then the
//!   descriptor
//!
//! A crash between two steps leaves one detectable inconsistency, which
//! [`QueueStore::scan`], [`QueueStore::release_stale_claims`] and
//! [`QueueStore::adopt_orphan_payloads`] resolve on the next run.
//!
//! Claims are atomic renames, but stale-claim release at startup assumes it is
//! the only worker. Running more than one worker against one queue directory is
//! not a supported configuration.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::Extensions;
use crate::error::{Error, Result};
use crate::model::{
    CLAIMED_SUFFIX, DESCRIPTOR_EXT, Lines, Status, TaskDescriptor, TaskId, format_timestamp,
};
use crate::telemetry::metrics;

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// The directories the queue protocol spans.
#[derive(Debug, Clone)]
pub struct QueueLayout {
    /// Watched for new files.
    pub source: PathBuf,
    /// Live payload + descriptor pairs.
    pub queue: PathBuf,
    /// Transform results.
    pub output: PathBuf,
    /// Completed pairs.
    pub archive: PathBuf,
    /// Pairs that exhausted their attempts.
    pub dead_letter: PathBuf,
    /// Descriptors that could not be trusted.
    pub quarantine: PathBuf,
}

impl QueueLayout {
    /// Lay every directory out under one root, using the default names.
    pub fn under(root: &Path) -> Self {
        Self {
            source: root.join("input"),
            queue: root.join("queue"),
            output: root.join("output"),
            archive: root.join("processed"),
            dead_letter: root.join("failed"),
            quarantine: root.join("quarantine"),
        }
    }

    /// Create every directory. Failure here is fatal at startup.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.source,
            &self.queue,
            &self.output,
            &self.archive,
            &self.dead_letter,
            &self.quarantine,
        ] {
            fs::create_dir_all(dir).map_err(|e| {
                Error::Config(format!("cannot create directory {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One enumeration of the queue directory.
#[derive(Debug, Default)]
pub struct QueueScan {
    /// Queued descriptors, oldest first.
    pub pending: Vec<TaskDescriptor>,
    /// Terminal descriptors still in the queue directory (interrupted relocation).
    pub stranded: Vec<TaskDescriptor>,
    /// Descriptors that failed to parse.
    pub corrupt: Vec<CorruptEntry>,
    /// Entries that could not be read at all; left in place and retried on
    /// the next scan.
    pub unreadable: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CorruptEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// A descriptor held under the in-progress marker name.
#[derive(Debug)]
pub struct Claim {
    descriptor: TaskDescriptor,
    path: PathBuf,
    payload: PathBuf,
}

impl Claim {
    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    /// Path of the claimed descriptor file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the payload in the queue directory.
    pub fn payload_path(&self) -> &Path {
        &self.payload
    }
}

/// What `fail` did with the task.
#[derive(Debug)]
pub enum FailOutcome {
    /// Released back to the queue for another attempt.
    Retrying { attempts: u32 },
    /// Out of attempts; moved to the dead-letter directory.
    DeadLettered(TaskDescriptor),
}

/// What startup adoption cleaned up.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AdoptReport {
    pub adopted: Vec<TaskId>,
    pub temp_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub quarantined: usize,
}

/// Where `find` located a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Queue,
    Claimed,
    Archive,
    DeadLetter,
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Location::Queue => "queue",
            Location::Claimed => "queue (claimed)",
            Location::Archive => "archive",
            Location::DeadLetter => "dead-letter",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Directory-scoped queue operations. Holds no task state in memory.
#[derive(Debug, Clone)]
pub struct QueueStore<C: Clock = SystemClock> {
    layout: QueueLayout,
    clock: C,
    max_attempts: u32,
}

impl QueueStore<SystemClock> {
    pub fn new(layout: QueueLayout) -> Self {
        Self::with_clock(layout, SystemClock)
    }
}

impl<C: Clock> QueueStore<C> {
    pub fn with_clock(layout: QueueLayout, clock: C) -> Self {
        Self {
            layout,
            clock,
            max_attempts: 3,
        }
    }

    /// Attempts before a failing task is dead-lettered (minimum 1).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Move `source` into the queue and publish its descriptor.
    ///
    /// Fails with `AlreadyQueued` (moving nothing) when a live task with the
    /// same id exists, and with `NotFound` when the source has vanished.
    pub fn enqueue(&self, source: &Path) -> Result<TaskDescriptor> {
        let id = TaskId::from_payload(source)
            .ok_or_else(|| Error::Other(format!("no task id for {}", source.display())))?;
        let payload_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Other(format!("bad file name {}", source.display())))?
            .to_string();

        let descriptor_path = self.layout.queue.join(id.descriptor_name());
        let target = self.layout.queue.join(&payload_name);
        if descriptor_path.exists()
            || self.layout.queue.join(id.claimed_name()).exists()
            || target.exists()
        {
            return Err(Error::AlreadyQueued(id));
        }

        move_file(source, &target).map_err(|e| io_error(e, source))?;

        let descriptor = TaskDescriptor::new(id, payload_name, self.clock.now());
        if let Err(e) = write_new(&descriptor_path, &descriptor.initial_lines()) {
            // Put the payload back so the next sweep sees it again.
            if let Err(undo) = move_file(&target, source) {
                warn!(payload = %target.display(), "could not return payload after failed enqueue: {undo}");
            }
            return Err(e);
        }

        metrics::tasks_enqueued().add(1, &[]);
        info!(id = %descriptor.id, payload = %descriptor.payload_name, "task queued");
        Ok(descriptor)
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    /// Snapshot of the queue directory's visible descriptors.
    pub fn scan(&self) -> Result<QueueScan> {
        let mut scan = QueueScan::default();

        for entry in fs::read_dir(&self.layout.queue)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(dir = %self.layout.queue.display(), "could not read queue entry: {e}");
                    continue;
                }
            };
            let Some(id) = visible_descriptor_id(&path) else {
                continue;
            };

            match read_descriptor(id, &path) {
                Ok(desc) if desc.status == Status::Queued => scan.pending.push(desc),
                Ok(desc) => scan.stranded.push(desc),
                Err(Error::CorruptDescriptor { path, reason }) => {
                    scan.corrupt.push(CorruptEntry { path, reason })
                }
                // Claimed or moved between read_dir and open.
                Err(Error::NotFound(_)) => continue,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable descriptor: {e}");
                    scan.unreadable.push(path);
                }
            }
        }

        scan.pending
            .sort_by(|a, b| a.queued_at.cmp(&b.queued_at).then_with(|| a.id.cmp(&b.id)));
        Ok(scan)
    }

    /// All Queued descriptors, oldest first. A fresh call sees new arrivals.
    pub fn list_pending(&self) -> Result<Vec<TaskDescriptor>> {
        Ok(self.scan()?.pending)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Take the in-progress marker for a pending task.
    pub fn claim(&self, descriptor: &TaskDescriptor) -> Result<Claim> {
        let from = self.layout.queue.join(descriptor.id.descriptor_name());
        let to = self.layout.queue.join(descriptor.id.claimed_name());
        fs::rename(&from, &to).map_err(|e| io_error(e, &from))?;

        let descriptor = read_descriptor(descriptor.id.clone(), &to)?;
        if descriptor.status != Status::Queued {
            // Put it back visibly so reconciliation finishes it.
            fs::rename(&to, &from)?;
            return Err(Error::InvalidTransition {
                from: descriptor.status,
                to: Status::Queued,
            });
        }

        debug!(id = %descriptor.id, "task claimed");
        let payload = self.layout.queue.join(&descriptor.payload_name);
        Ok(Claim {
            descriptor,
            path: to,
            payload,
        })
    }

    /// Drop the in-progress marker without changing the task.
    pub fn release(&self, claim: Claim) -> Result<()> {
        let visible = self.layout.queue.join(claim.descriptor.id.descriptor_name());
        fs::rename(&claim.path, &visible)?;
        Ok(())
    }

    /// Rename `{id}.task.claimed` back to `{id}.task` so the next scan sees
    /// the task again. Returns `false` when no claim was left to return.
    pub fn unclaim(&self, id: &TaskId) -> Result<bool> {
        let claimed = self.layout.queue.join(id.claimed_name());
        let visible = self.layout.queue.join(id.descriptor_name());
        match fs::rename(&claimed, &visible) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(e, &claimed)),
        }
    }

    /// Best-effort [`unclaim`](Self::unclaim) after a transition failed
    /// partway. A terminal descriptor is then relocated by the next scan and
    /// a queued one is retried.
    fn return_claim(&self, id: &TaskId) {
        match self.unclaim(id) {
            Ok(true) => warn!(id = %id, "claim returned to queue after error"),
            Ok(false) => {}
            Err(e) => error!(id = %id, "could not return claim to queue: {e}"),
        }
    }

    /// Release every leftover claim (a worker died mid-transform). Returns how
    /// many were released. Must only run while no other worker is active.
    pub fn release_stale_claims(&self) -> Result<usize> {
        let mut released = 0;
        for entry in fs::read_dir(&self.layout.queue)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("could not read queue entry: {e}");
                    continue;
                }
            };
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name
                .ends_with(CLAIMED_SUFFIX)
                .then(|| TaskId::from_descriptor_name(name))
                .flatten()
            else {
                continue;
            };

            let visible = self.layout.queue.join(id.descriptor_name());
            if visible.exists() {
                if let Err(e) = self.quarantine(&path, "claimed descriptor shadows a visible one") {
                    error!(id = %id, "could not quarantine shadowing claim: {e}");
                }
                continue;
            }
            match fs::rename(&path, &visible) {
                Ok(()) => {
                    warn!(id = %id, "released stale claim");
                    released += 1;
                }
                Err(e) => error!(id = %id, "could not release stale claim: {e}"),
            }
        }
        Ok(released)
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    /// Record success and archive the pair. The descriptor moves last. On
    /// error the claim is returned to the queue.
    pub fn complete(&self, claim: Claim, output_name: &str) -> Result<TaskDescriptor> {
        let id = claim.descriptor.id.clone();
        self.complete_claimed(claim, output_name)
            .inspect_err(|_| self.return_claim(&id))
    }

    fn complete_claimed(&self, claim: Claim, output_name: &str) -> Result<TaskDescriptor> {
        let mut desc = claim.descriptor;
        check_transition(desc.status, Status::Completed)?;
        if !claim.payload.exists() {
            return Err(Error::NotFound(claim.payload.display().to_string()));
        }

        let now = self.clock.now();
        let (payload_name, renamed) =
            free_pair_name(&self.layout.archive, &desc.id, &desc.payload_name);

        let mut lines = Lines::new()
            .push("processed_at", format_timestamp(now))
            .push("status", Status::Completed.to_string())
            .push("output_file", output_name);
        if renamed {
            lines = lines.push("archive_file", &payload_name);
        }
        append(&claim.path, &lines)?;

        desc.status = Status::Completed;
        desc.terminal_at = Some(now);
        desc.output_name = Some(output_name.to_string());
        if renamed {
            desc.archive_name = Some(payload_name);
        }

        self.relocate(&claim.path, &desc, &self.layout.archive)?;
        record_transition(Status::Queued, Status::Completed);
        info!(id = %desc.id, output = output_name, "task completed");
        Ok(desc)
    }

    /// Record a failed attempt. Retries until `max_attempts`, then moves the
    /// pair to the dead-letter directory with `status=failed`. On error the
    /// claim is returned to the queue.
    pub fn fail(&self, claim: Claim, reason: &str) -> Result<FailOutcome> {
        let id = claim.descriptor.id.clone();
        self.fail_claimed(claim, reason)
            .inspect_err(|_| self.return_claim(&id))
    }

    fn fail_claimed(&self, claim: Claim, reason: &str) -> Result<FailOutcome> {
        let mut desc = claim.descriptor.clone();
        check_transition(desc.status, Status::Failed)?;
        let attempts = desc.attempts + 1;

        if attempts < self.max_attempts {
            append(
                &claim.path,
                &Lines::new()
                    .push("attempts", attempts.to_string())
                    .push("last_error", reason),
            )?;
            self.release(claim)?;
            warn!(id = %desc.id, attempts, max = self.max_attempts, error = reason, "attempt failed, will retry");
            return Ok(FailOutcome::Retrying { attempts });
        }

        let now = self.clock.now();
        let (payload_name, renamed) =
            free_pair_name(&self.layout.dead_letter, &desc.id, &desc.payload_name);
        let reason = format!("exhausted {attempts}/{} attempts: {reason}", self.max_attempts);

        let mut lines = Lines::new()
            .push("attempts", attempts.to_string())
            .push("failed_at", format_timestamp(now))
            .push("status", Status::Failed.to_string())
            .push("reason", &reason);
        if renamed {
            lines = lines.push("archive_file", &payload_name);
        }
        append(&claim.path, &lines)?;

        desc.attempts = attempts;
        desc.status = Status::Failed;
        desc.terminal_at = Some(now);
        desc.reason = Some(reason);
        if renamed {
            desc.archive_name = Some(payload_name);
        }

        self.relocate(&claim.path, &desc, &self.layout.dead_letter)?;
        record_transition(Status::Queued, Status::Failed);
        warn!(id = %desc.id, attempts, "task dead-lettered");
        Ok(FailOutcome::DeadLettered(desc))
    }

    /// Finish moving a terminal descriptor that was left in the queue
    /// directory by an interrupted `complete` or `fail`.
    pub fn finish_relocation(&self, desc: &TaskDescriptor) -> Result<()> {
        let dest = match desc.status {
            Status::Completed => &self.layout.archive,
            Status::Failed => &self.layout.dead_letter,
            Status::Queued => {
                return Err(Error::InvalidTransition {
                    from: Status::Queued,
                    to: Status::Queued,
                });
            }
        };
        let path = self.layout.queue.join(desc.id.descriptor_name());
        self.relocate(&path, desc, dest)?;
        warn!(id = %desc.id, status = %desc.status, "finished interrupted relocation");
        Ok(())
    }

    /// Move payload then descriptor into `dest`, under the archived names.
    fn relocate(&self, descriptor_path: &Path, desc: &TaskDescriptor, dest: &Path) -> Result<()> {
        let payload = self.layout.queue.join(&desc.payload_name);
        let archived_payload = dest.join(desc.archived_payload_name());
        let archived_id = TaskId::from_payload(Path::new(desc.archived_payload_name()))
            .unwrap_or_else(|| desc.id.clone());

        match move_file(&payload, &archived_payload) {
            Ok(()) => {}
            // Already moved before an interruption.
            Err(e) if e.kind() == io::ErrorKind::NotFound && archived_payload.exists() => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(id = %desc.id, "payload missing during relocation");
            }
            Err(e) => return Err(e.into()),
        }
        move_file(descriptor_path, &dest.join(archived_id.descriptor_name()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Quarantine and recovery
    // -----------------------------------------------------------------------

    /// Move a descriptor aside so it is never retried. Returns its new path.
    pub fn quarantine(&self, path: &Path, reason: &str) -> Result<PathBuf> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Other(format!("bad path {}", path.display())))?;
        let dest = free_path(&self.layout.quarantine, name);

        append(
            path,
            &Lines::new()
                .push("quarantined_at", format_timestamp(self.clock.now()))
                .push("quarantine_reason", reason),
        )?;
        move_file(path, &dest).map_err(|e| io_error(e, path))?;

        metrics::tasks_quarantined().add(1, &[]);
        warn!(from = %path.display(), to = %dest.display(), reason, "descriptor quarantined");
        Ok(dest)
    }

    /// Give a descriptor to every recognized payload in the queue directory
    /// that lacks one (enqueue interrupted between its two steps), and remove
    /// temporary descriptor files left behind by interrupted writes.
    pub fn adopt_orphan_payloads(&self, extensions: &Extensions) -> Result<AdoptReport> {
        let mut report = AdoptReport::default();
        let mut names: Vec<String> = fs::read_dir(&self.layout.queue)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();

        for name in names {
            let path = self.layout.queue.join(&name);
            if name.starts_with('.') && name.ends_with(".tmp") {
                fs::remove_file(&path)?;
                report.temp_removed += 1;
                continue;
            }
            if !extensions.matches(&path) || !path.is_file() {
                continue;
            }
            let Some(id) = TaskId::from_payload(&path) else {
                continue;
            };
            let descriptor_path = self.layout.queue.join(id.descriptor_name());
            if descriptor_path.exists() || self.layout.queue.join(id.claimed_name()).exists() {
                continue;
            }

            let descriptor = TaskDescriptor::new(id, name, self.clock.now());
            write_new(&descriptor_path, &descriptor.initial_lines())?;
            warn!(id = %descriptor.id, "adopted payload without descriptor");
            report.adopted.push(descriptor.id);
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn counts(&self) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        for entry in fs::read_dir(&self.layout.queue)? {
            let path = entry?.path();
            if visible_descriptor_id(&path).is_some() {
                counts.queued += 1;
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(CLAIMED_SUFFIX))
            {
                counts.claimed += 1;
            }
        }
        counts.completed = count_descriptors(&self.layout.archive)?;
        counts.failed = count_descriptors(&self.layout.dead_letter)?;
        counts.quarantined = fs::read_dir(&self.layout.quarantine)?.count();
        Ok(counts)
    }

    /// Locate a task's descriptor in the queue, archive or dead-letter area.
    pub fn find(&self, id: &TaskId) -> Result<Option<(Location, TaskDescriptor)>> {
        let candidates = [
            (Location::Queue, self.layout.queue.join(id.descriptor_name())),
            (Location::Claimed, self.layout.queue.join(id.claimed_name())),
            (Location::Archive, self.layout.archive.join(id.descriptor_name())),
            (Location::DeadLetter, self.layout.dead_letter.join(id.descriptor_name())),
        ];
        for (location, path) in candidates {
            match read_descriptor(id.clone(), &path) {
                Ok(desc) => return Ok(Some((location, desc))),
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Id of a visible (unclaimed, non-temporary) descriptor path.
fn visible_descriptor_id(path: &Path) -> Option<TaskId> {
    if path.extension().and_then(|e| e.to_str()) != Some(DESCRIPTOR_EXT) {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    TaskId::from_descriptor_name(name)
}

fn count_descriptors(dir: &Path) -> Result<usize> {
    Ok(fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| visible_descriptor_id(&e.path()).is_some())
        .count())
}

fn read_descriptor(id: TaskId, path: &Path) -> Result<TaskDescriptor> {
    let text = match fs::read(path) {
        Ok(bytes) => String::from_utf8(bytes).map_err(|_| Error::CorruptDescriptor {
            path: path.to_path_buf(),
            reason: "not valid UTF-8".to_string(),
        })?,
        Err(e) => return Err(io_error(e, path)),
    };
    TaskDescriptor::parse(id, &text).map_err(|reason| Error::CorruptDescriptor {
        path: path.to_path_buf(),
        reason,
    })
}

/// Write a new file under a temporary name, flush it, then rename it into place.
fn write_new(path: &Path, lines: &Lines) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Other(format!("no parent for {}", path.display())))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Other(format!("bad path {}", path.display())))?;
    let tmp = dir.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));

    let written = (|| -> io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(lines.render().as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Append lines to an existing descriptor and flush before returning.
fn append(path: &Path, lines: &Lines) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| io_error(e, path))?;

    let mut text = String::new();
    if file.metadata()?.len() > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            text.push('\n');
        }
    }
    text.push_str(&lines.render());

    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// `rename`, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to)?;
            File::open(to)?.sync_all()?;
            fs::remove_file(from)
        }
        other => other,
    }
}

/// Pick a payload name in `dir` such that neither it nor its descriptor name is
/// taken. Returns the name and whether it differs from `payload_name`.
fn free_pair_name(dir: &Path, id: &TaskId, payload_name: &str) -> (String, bool) {
    if !dir.join(payload_name).exists() && !dir.join(id.descriptor_name()).exists() {
        return (payload_name.to_string(), false);
    }
    let ext = Path::new(payload_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let suffixed = TaskId::new(format!("{id}-{n}"));
        let candidate = format!("{suffixed}{ext}");
        if !dir.join(&candidate).exists() && !dir.join(suffixed.descriptor_name()).exists() {
            return (candidate, true);
        }
        n += 1;
    }
}

/// `dir/name`, or `dir/name.N` for the first free N.
fn free_path(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{name}.{n}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn io_error(e: io::Error, path: &Path) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::NotFound(path.display().to_string())
    } else {
        Error::Io(e)
    }
}

fn check_transition(from: Status, to: Status) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

fn record_transition(from: Status, to: Status) {
    metrics::task_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
