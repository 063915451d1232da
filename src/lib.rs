//! Agent Jobs — background-job control plane.
//!
//! Tracks long-running asynchronous jobs for an agentic task-execution
//! platform: at most one active runner per job across worker processes
//! (TTL-based distributed lock), a replayable sequence-numbered event log
//! that clients can stream and resume, and human-in-the-loop pause states.
//!
//! The shared store (the "mirror") is a TTL'd cache that makes job state
//! visible across processes — it is not a system of record.

pub mod config;
pub mod error;
pub mod jobs;
pub mod lock;
pub mod mirror;

pub use config::JobManagerConfig;
pub use error::{Error, JobError, LockError, MirrorError, Result};
pub use jobs::{CancelToken, Event, JobManager, JobSnapshot, JobStatus, StatusUpdate, Truncation};
pub use lock::{LocalRunnerLock, RunnerLock};
pub use mirror::{MemoryMirror, MirrorStore};
