//! Job admission and dispatch
//!
//! - Cross-process job locks keyed by script and session
//! - Budgeted, chunked scheduling of candidate checks
//! - The line-oriented progress log

pub mod lock;
pub mod progress;
pub mod scheduler;

pub use lock::{FileJobLock, JobKey, JobLock, JobLockGuard, MemoryJobLock, Trigger};
pub use progress::{Mark, ProgressLog};
pub use scheduler::{AcceptedJob, CheckerKind, JobInput, JobOptions, JobStatus, JobSummary, Scheduler};
