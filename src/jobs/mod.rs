//! Job system: state machine, status records, and the file-backed queue.
//!
//! - `state`: Job state machine (Pending → InProgress → Completed/Failed)
//! - `status`: StatusStore, atomic per-conversation status records
//! - `queue`: JobQueue, descriptors plus priority dequeue and claiming

pub mod queue;
pub mod state;
pub mod status;

pub use queue::{DEFAULT_MAX_ATTEMPTS, JobDescriptor, JobQueue};
pub use state::{JobErrorInfo, JobPhase, JobState, JobStatus, Progress};
pub use status::StatusStore;
