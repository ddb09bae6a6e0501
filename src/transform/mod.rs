//! Transform capability consumed by the worker.
//!
//! A transform turns one queued payload into one output file and reports the
//! output's path. The worker never inspects payload contents itself.

pub mod invert;

pub use invert::InvertTransform;

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// `Transform(inputPath) -> (outputPath, ok)`.
///
/// Implementations run on a blocking thread and must not touch the queue
/// directory beyond reading `input`.
pub trait Transform: Send + Sync + 'static {
    fn transform(&self, input: &Path) -> Result<PathBuf, TransformError>;
}

impl<F> Transform for F
where
    F: Fn(&Path) -> Result<PathBuf, TransformError> + Send + Sync + 'static,
{
    fn transform(&self, input: &Path) -> Result<PathBuf, TransformError> {
        self(input)
    }
}
