//! Configuration types.

use std::time::Duration;

/// Job manager configuration.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// TTL applied to mirrored record and event keys. Refreshed on every
    /// write; expiry reclaims abandoned jobs from the shared store.
    pub record_ttl: Duration,
    /// Maximum events kept in the local per-job buffer.
    pub max_events: usize,
    /// Maximum cumulative serialized bytes of the local per-job buffer.
    pub max_event_log_bytes: usize,
    /// Per-event serialized byte budget; larger payloads are deep-truncated.
    pub max_event_bytes: usize,
    /// Length cap on the mirrored event list (independent of the local buffer).
    pub mirror_event_cap: usize,
    /// Long-poll slice for `wait_for_events` — short, so cross-process
    /// mirror writes that produce no local wakeup are still noticed.
    pub wait_slice: Duration,
    /// Operator opt-in: degrade to local-only locking when the shared lock
    /// store errors, instead of failing closed. Two runners may then execute
    /// the same job concurrently across processes — keep side effects
    /// idempotent if this is enabled.
    pub degrade_locking: bool,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(24 * 3600), // 24 hours
            max_events: 500,
            max_event_log_bytes: 256 * 1024,
            max_event_bytes: 32 * 1024,
            mirror_event_cap: 1000,
            wait_slice: Duration::from_millis(250),
            degrade_locking: false,
        }
    }
}
