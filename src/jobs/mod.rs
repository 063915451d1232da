//! Job control plane — records, event log, and the manager facade.
//!
//! Core components:
//! - `status` — job status state machine (terminal set, transition rules)
//! - `event` — sequence-numbered log entries with bounded payloads
//! - `record` — process-local records and the mirrored snapshot form
//! - `manager` — the `JobManager` facade consumed by the HTTP layer and
//!   the execution callable

pub mod event;
pub mod manager;
pub mod record;
pub mod status;

pub use event::{Event, Truncation};
pub use manager::{JobManager, StatusUpdate};
pub use record::{CancelToken, JobRecord, JobSnapshot, SNAPSHOT_SCHEMA_VERSION};
pub use status::JobStatus;
