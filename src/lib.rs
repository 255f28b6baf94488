//! Offload: background job orchestration over a shared filesystem.

pub mod config;
pub mod error;
pub mod jobs;
pub mod service;
pub mod store;
pub mod tools;
pub mod worker;

pub use service::{JobRequest, JobService};
