//! Worker shell around the Courier engine.
//!
//! Owns the queue-facing side: payload validation, tracking construction,
//! progress events and publishing. The queue transport itself stays behind
//! the [`job::JobSource`] and [`job::JobPublisher`] traits.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod config;
pub mod job;
pub mod stdio;

pub use config::WorkerConfig;
pub use job::{JobLoop, JobPublisher, JobSource};
