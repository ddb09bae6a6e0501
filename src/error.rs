//! Error types for dropq.

use std::path::PathBuf;

use thiserror::Error;

use crate::model::{Status, TaskId};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("task already queued: {0}")]
    AlreadyQueued(TaskId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("corrupt descriptor {}: {reason}", path.display())]
    CorruptDescriptor { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
