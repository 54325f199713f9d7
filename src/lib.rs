//! # workrelay
//!
//! Dispatches jobs to remote workers over a message bus and routes their
//! completion or failure notifications back to the waiting caller.
//!
//! Admission is gated twice: [`processor::ProcessorQueue`] holds jobs back
//! while too many payload bytes are in flight, and [`queue::Queue`] holds
//! them back while too many jobs are outstanding. Every job ends exactly
//! once: completed, failed, or timed out.

pub mod config;
pub mod db;
pub mod error;
mod gate;
pub mod host;
pub mod job;
pub mod notification;
pub mod processor;
pub mod queue;
pub mod telemetry;
pub mod transport;

pub use error::{Error, ErrorKind, Result};
pub use job::{JobId, JobRequest, Payload, WorkItem};
pub use processor::{ProcessorConfig, ProcessorQueue};
pub use queue::{Queue, QueueConfig, QueueStats};
