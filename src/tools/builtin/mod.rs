//! Built-in executors.

pub mod echo;
pub mod shell;

pub use echo::EchoExecutor;
pub use shell::ShellExecutor;
