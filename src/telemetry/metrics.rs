//! Metric instrument factories for taskq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an exporter installed the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: tasks created by clients.
/// Labels: `queue`, `result` ("created" | "cached").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.submitted")
        .with_description("Number of tasks submitted by clients")
        .build()
}

/// Counter: task status transitions persisted by processors and clients.
/// Labels: `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: queue operations.
/// Labels: `queue`, `priority`, `operation` ("push" | "pop").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: cache lookups.
/// Labels: `result` ("hit" | "miss" | "expired" | "stale" | "collision" | "corrupted").
pub fn cache_lookups() -> Counter<u64> {
    meter()
        .u64_counter("taskq.cache.lookups")
        .with_description("Number of result cache lookups")
        .build()
}

/// Up-down counter: executions currently holding a processor slot.
pub fn executions_in_flight() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("taskq.executions.in_flight")
        .with_description("Task executions currently running")
        .build()
}

/// Histogram: work function duration in milliseconds.
/// Labels: `outcome` ("done" | "failed").
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.executions.duration_ms")
        .with_description("Work function duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: processor loop iterations that failed before reaching user work.
pub fn poll_errors() -> Counter<u64> {
    meter()
        .u64_counter("taskq.processor.poll_errors")
        .with_description("Processor poll iterations that failed")
        .build()
}
