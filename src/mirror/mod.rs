//! Mirror store — shared key-value cache making job state visible across
//! processes.
//!
//! The mirror is a TTL'd cache, not a system of record: every write
//! refreshes the key's TTL, and an abandoned job simply ages out. One
//! string key per job holds the serialized [`JobSnapshot`], one list key
//! holds serialized events (length-capped independently of the local
//! buffer), and one string key holds the current runner-lock owner token.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::MirrorError;
use crate::jobs::{Event, JobSnapshot};

pub use self::memory::MemoryMirror;
pub use self::redis::RedisMirror;

/// Key scheme shared by the mirror backends and the distributed lock.
pub(crate) mod keys {
    /// Serialized [`super::JobSnapshot`] (string, TTL-refreshed).
    pub fn record(job_id: &str) -> String {
        format!("agent_jobs:job:{job_id}:record")
    }

    /// Serialized events (list, length-capped, TTL-refreshed).
    pub fn events(job_id: &str) -> String {
        format!("agent_jobs:job:{job_id}:events")
    }

    /// Current runner-lock owner token (string, TTL'd).
    pub fn runner(job_id: &str) -> String {
        format!("agent_jobs:job:{job_id}:runner")
    }
}

/// Backend-agnostic mirror interface.
///
/// Chosen at manager construction time; `None` means local-only mode.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Write the record snapshot, refreshing its TTL.
    async fn save_record(&self, snapshot: &JobSnapshot, ttl: Duration) -> Result<(), MirrorError>;

    /// Read a record snapshot. Returns `None` when the key is absent,
    /// expired, or carries an unknown schema version.
    async fn load_record(&self, job_id: &str) -> Result<Option<JobSnapshot>, MirrorError>;

    /// Append one event to the job's mirrored list, trimming it to the
    /// newest `cap` entries and refreshing the TTL.
    async fn append_event(
        &self,
        job_id: &str,
        event: &Event,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), MirrorError>;

    /// Read the mirrored event list (oldest first; may be trimmed).
    async fn load_events(&self, job_id: &str) -> Result<Vec<Event>, MirrorError>;
}

/// Parse a snapshot, filtering out unknown schema versions.
pub(crate) fn parse_snapshot(raw: &str) -> Result<Option<JobSnapshot>, MirrorError> {
    let snapshot: JobSnapshot = serde_json::from_str(raw)?;
    if !snapshot.is_readable() {
        tracing::warn!(
            job_id = %snapshot.job_id,
            schema_version = snapshot.schema_version,
            "Ignoring mirrored snapshot with unknown schema version"
        );
        return Ok(None);
    }
    Ok(Some(snapshot))
}
