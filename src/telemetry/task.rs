//! Task execution span helpers.

use tracing::Span;

use crate::model::{Status, TaskId};

/// Start a span covering one execution of a task on a processor.
///
/// `task.status` is declared empty and filled by
/// [`record_state_transition`].
pub fn start_task_span(queue: &str, task_id: &TaskId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.queue" = queue,
        "task.id" = %task_id,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a persisted status change on `span` and bump the transition counter.
pub fn record_state_transition(span: &Span, from: Status, to: Status) {
    span.record("task.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
    super::metrics::task_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", from.as_str()),
            opentelemetry::KeyValue::new("to", to.as_str()),
        ],
    );
}
