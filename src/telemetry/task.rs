//! Per-task span helpers for the worker.

use tracing::Span;

use crate::model::{Status, TaskId};

/// Start a span covering one processing attempt of a task.
///
/// `task.status` is declared empty and filled by [`record_state_transition`].
pub fn start_task_span(id: &TaskId, attempt: u32) -> Span {
    tracing::info_span!(
        "task.process",
        "task.id" = %id,
        "task.attempt" = attempt,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a status transition on the span and emit it as an event.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("task.status", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
