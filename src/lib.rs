//! # dropq
//!
//! A crash-tolerant drop-folder work queue backed by the filesystem.
//!
//! An ingestor watches a source directory and moves each arriving image into
//! a queue directory next to a `{id}.task` descriptor. A worker polls the
//! queue, runs a [`transform::Transform`] (colour inversion by default) on
//! each payload, and archives the pair. The two loops share nothing but the
//! directories, so they can run in one process or in two.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod store;
pub mod telemetry;
pub mod transform;
