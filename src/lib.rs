//! # taskq
//!
//! A Redis-backed distributed task queue.
//!
//! Clients submit typed inputs at one of three priorities and can poll for
//! the output. Processors pop ids in priority order, run a user work function
//! with bounded concurrency and write the result back. Finished results can be
//! reused for identical inputs through a content-addressed cache.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod processor;
pub mod store;
pub mod telemetry;
pub mod validate;

pub use client::{Client, TaskResult};
pub use error::{Error, Result};
pub use model::{Priority, Status, Task, TaskError, TaskId, TaskOutput};
pub use processor::{Processor, Work};
