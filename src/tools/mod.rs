//! Executors and the registry that routes tool names to them.

pub mod builtin;
pub mod executor;
pub mod registry;

pub use executor::{ExecutionContext, Executor, ProgressReporter, require_str};
pub use registry::ExecutorRegistry;
