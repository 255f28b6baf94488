//! Worker system: background execution of queued jobs.
//!
//! - `scheduler`: poll loop, concurrency ceiling, stall recovery at start
//! - `worker`: runs one claimed job: progress, executor, retry-or-fail

pub mod scheduler;
pub mod worker;

pub use scheduler::Scheduler;
pub use worker::{JobOutcome, Worker, WorkerDeps};
