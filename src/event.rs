//! Filesystem change events consumed by the ingestor.
//!
//! The ingestor only cares about two things happening in the source
//! directory: a file was created there, or a file was moved into it. Everything
//! the OS reports is narrowed to [`FsEvent`] here, so the ingestor can be driven
//! by a real watcher or by a test feeding the channel directly.

use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Moved,
}

/// A file appeared in the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

impl FsEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Created,
            path: path.into(),
        }
    }

    pub fn moved(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::Moved,
            path: path.into(),
        }
    }
}

/// Narrow a raw notify event to the arrivals the ingestor acts on.
pub fn classify(event: &notify::Event) -> Vec<FsEvent> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => event.paths.iter().cloned().map(FsEvent::created).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().cloned().map(FsEvent::moved).collect()
        }
        // Both = [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .get(1)
            .cloned()
            .map(FsEvent::moved)
            .into_iter()
            .collect(),
        // Platforms that cannot tell the two ends apart; the ingestor drops
        // whichever path no longer exists.
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().cloned().map(FsEvent::moved).collect()
        }
        _ => Vec::new(),
    }
}

/// Live watch on one directory. Dropping it releases the OS watch handle.
pub struct DirectoryWatcher {
    _watcher: RecommendedWatcher,
}

impl DirectoryWatcher {
    /// Watch `dir` (non-recursively). Arrivals are delivered on the returned
    /// channel; the callback never blocks, so no notification is dropped while
    /// the ingestor is busy with an earlier one.
    pub fn watch(dir: &Path) -> Result<(Self, mpsc::UnboundedReceiver<FsEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for fs_event in classify(&event) {
                        debug!(kind = ?fs_event.kind, path = %fs_event.path.display(), "fs event");
                        // Receiver gone means the ingestor stopped.
                        let _ = tx.send(fs_event);
                    }
                }
                Err(e) => warn!("watch error: {e}"),
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        Ok((Self { _watcher: watcher }, rx))
    }
}
