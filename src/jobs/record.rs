//! Job records — process-local state plus the mirrored snapshot form.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::event::{Event, Truncation};
use super::status::JobStatus;

/// Version tag written into every mirrored snapshot. Readers reject
/// snapshots carrying an unknown version instead of guessing at shape.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Serialized view of a job, mirrored to the shared store.
///
/// Process-local handles (runner task, cancel token, waiters) are never
/// part of this; another process hydrating from a snapshot gets a shadow
/// copy of the state, not the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub schema_version: u32,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Free-form UI sub-status (e.g. "planning", "executing step 3/7").
    pub phase: String,
    pub user_id: String,
    pub org_id: String,
    /// Opaque job input.
    pub payload: Value,
    /// Mutable key-value bag, merged field-by-field.
    pub metadata: serde_json::Map<String, Value>,
    /// Structured approval-gate descriptor, opaque to the control plane.
    pub pending_approval: Option<Value>,
    pub error: Option<String>,
    /// Next sequence number to assign; strictly monotonic, never reused.
    pub next_sequence: u64,
}

impl JobSnapshot {
    /// True if this snapshot's version is one this build can read.
    pub fn is_readable(&self) -> bool {
        self.schema_version == SNAPSHOT_SCHEMA_VERSION
    }
}

/// Mutable job state, guarded by the owning [`JobRecord`]'s lock.
///
/// Sequence assignment, buffer maintenance, and snapshot construction all
/// happen while this is held, so concurrent appends in one process can
/// never collide.
#[derive(Debug)]
pub struct JobState {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobStatus,
    pub phase: String,
    pub user_id: String,
    pub org_id: String,
    pub payload: Value,
    pub metadata: serde_json::Map<String, Value>,
    pub pending_approval: Option<Value>,
    pub error: Option<String>,
    pub next_sequence: u64,
    /// Local event buffer, bounded by count and cumulative bytes.
    pub events: VecDeque<Event>,
    /// Cumulative serialized size of `events`.
    pub event_bytes: usize,
    /// Evictions/shavings not yet announced on an appended event.
    pub pending_truncated_events: u64,
    pub pending_truncated_bytes: u64,
}

impl JobState {
    /// Fresh state for a newly created job.
    pub fn new(
        job_id: impl Into<String>,
        payload: Value,
        user_id: impl Into<String>,
        org_id: impl Into<String>,
        metadata: Option<serde_json::Map<String, Value>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            created_at: now,
            updated_at: now,
            status: JobStatus::Queued,
            phase: "queued".to_string(),
            user_id: user_id.into(),
            org_id: org_id.into(),
            payload,
            metadata: metadata.unwrap_or_default(),
            pending_approval: None,
            error: None,
            next_sequence: 1,
            events: VecDeque::new(),
            event_bytes: 0,
            pending_truncated_events: 0,
            pending_truncated_bytes: 0,
        }
    }

    /// Hydrate a shadow copy from a mirrored snapshot plus its event list.
    pub fn from_snapshot(snapshot: JobSnapshot, events: Vec<Event>) -> Self {
        let event_bytes = events.iter().map(Event::serialized_len).sum();
        Self {
            job_id: snapshot.job_id,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            status: snapshot.status,
            phase: snapshot.phase,
            user_id: snapshot.user_id,
            org_id: snapshot.org_id,
            payload: snapshot.payload,
            metadata: snapshot.metadata,
            pending_approval: snapshot.pending_approval,
            error: snapshot.error,
            next_sequence: snapshot.next_sequence,
            events: events.into(),
            event_bytes,
            pending_truncated_events: 0,
            pending_truncated_bytes: 0,
        }
    }

    /// Build the mirrored snapshot of the current state.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            job_id: self.job_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            status: self.status,
            phase: self.phase.clone(),
            user_id: self.user_id.clone(),
            org_id: self.org_id.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            pending_approval: self.pending_approval.clone(),
            error: self.error.clone(),
            next_sequence: self.next_sequence,
        }
    }

    /// Refresh mutable fields from a mirror snapshot.
    ///
    /// Status, phase, metadata, pending_approval, and error adopt the mirror
    /// copy (last write wins), except that a locally terminal status is
    /// never regressed. Events and `next_sequence` are handled separately —
    /// only when the mirror's counter is strictly ahead (see
    /// [`JobState::adopt_events`]).
    pub fn refresh_from(&mut self, snapshot: JobSnapshot) {
        if !self.status.is_terminal() {
            self.status = snapshot.status;
            self.pending_approval = snapshot.pending_approval;
        }
        self.phase = snapshot.phase;
        self.metadata = snapshot.metadata;
        self.error = snapshot.error;
        self.updated_at = snapshot.updated_at.max(self.updated_at);
    }

    /// Adopt the mirror's event list and counter.
    ///
    /// Only called when `mirror_next_sequence > self.next_sequence`; the
    /// local counter takes the larger of the two so sequence numbers are
    /// never reused, even if this process later appends without the mirror.
    pub fn adopt_events(&mut self, events: Vec<Event>, mirror_next_sequence: u64) {
        self.event_bytes = events.iter().map(Event::serialized_len).sum();
        self.events = events.into();
        self.next_sequence = self.next_sequence.max(mirror_next_sequence);
    }

    /// Evict oldest events until the buffer fits the count and byte caps.
    ///
    /// Eviction never touches sequence numbers; it only forgets old entries
    /// locally. The dropped totals are accumulated for the next append's
    /// `truncation` descriptor.
    pub fn enforce_bounds(&mut self, max_events: usize, max_bytes: usize) {
        while self.events.len() > max_events || self.event_bytes > max_bytes {
            let Some(evicted) = self.events.pop_front() else {
                break;
            };
            let len = evicted.serialized_len();
            self.event_bytes = self.event_bytes.saturating_sub(len);
            self.pending_truncated_events += 1;
            self.pending_truncated_bytes += len as u64;
        }
    }

    /// Take the accumulated truncation descriptor, if any, resetting it.
    pub fn take_pending_truncation(&mut self, reason: &str) -> Option<Truncation> {
        if self.pending_truncated_events == 0 && self.pending_truncated_bytes == 0 {
            return None;
        }
        let truncation = Truncation {
            truncated_events: self.pending_truncated_events,
            truncated_bytes: self.pending_truncated_bytes,
            reason: reason.to_string(),
        };
        self.pending_truncated_events = 0;
        self.pending_truncated_bytes = 0;
        Some(truncation)
    }
}

/// A process-local job record: guarded state plus execution handles.
///
/// The state lock doubles as the append lock; `notify` wakes local
/// `wait_for_events` callers. The runner handle and cancel token exist only
/// in the process that spawned the work — a shadow copy hydrated from the
/// mirror has neither.
#[derive(Debug)]
pub struct JobRecord {
    pub(crate) state: Mutex<JobState>,
    pub(crate) notify: Notify,
    pub(crate) cancel: CancelToken,
    pub(crate) runner: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl JobRecord {
    pub(crate) fn new(state: JobState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            notify: Notify::new(),
            cancel: CancelToken::new(),
            runner: std::sync::Mutex::new(None),
        })
    }

    /// True if a runner task is attached in this process and still alive.
    pub(crate) fn has_live_runner(&self) -> bool {
        self.runner
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Drop the attached runner handle, if any. The task itself keeps
    /// running; stopping it is the cancel token's job.
    pub(crate) fn detach_runner(&self) {
        if let Ok(mut guard) = self.runner.lock() {
            guard.take();
        }
    }
}

/// Cooperative cancellation flag handed to the execution callable.
///
/// Runners check `is_canceled` (or await `cancelled`) at their own yield
/// points; nothing force-aborts the task. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag and wake anyone awaiting `cancelled`.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the token is canceled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_canceled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> JobState {
        JobState::new("job-1", json!({"x": 1}), "u1", "org-1", None)
    }

    #[test]
    fn snapshot_roundtrip() {
        let state = state();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.schema_version, SNAPSHOT_SCHEMA_VERSION);
        assert!(snapshot.is_readable());

        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: JobSnapshot = serde_json::from_str(&json).unwrap();
        let hydrated = JobState::from_snapshot(parsed, Vec::new());
        assert_eq!(hydrated.job_id, "job-1");
        assert_eq!(hydrated.status, JobStatus::Queued);
        assert_eq!(hydrated.next_sequence, 1);
    }

    #[test]
    fn unknown_schema_version_is_unreadable() {
        let mut snapshot = state().snapshot();
        snapshot.schema_version = 99;
        assert!(!snapshot.is_readable());
    }

    #[test]
    fn refresh_never_regresses_terminal_status() {
        let mut local = state();
        local.status = JobStatus::Completed;

        let mut stale = state().snapshot();
        stale.status = JobStatus::Running;
        stale.pending_approval = Some(json!({"gate": "tool"}));

        local.refresh_from(stale);
        assert_eq!(local.status, JobStatus::Completed);
        assert!(local.pending_approval.is_none());
    }

    #[test]
    fn adopt_events_takes_larger_counter() {
        let mut local = state();
        local.next_sequence = 10;
        local.adopt_events(Vec::new(), 7);
        assert_eq!(local.next_sequence, 10);
        local.adopt_events(Vec::new(), 15);
        assert_eq!(local.next_sequence, 15);
    }

    #[test]
    fn enforce_bounds_evicts_oldest_and_accumulates() {
        let mut state = state();
        for i in 0..10 {
            let mut event = Event::new("tick").field("i", i);
            event.sequence = i + 1;
            state.event_bytes += event.serialized_len();
            state.events.push_back(event);
        }
        state.enforce_bounds(4, usize::MAX);
        assert_eq!(state.events.len(), 4);
        assert_eq!(state.events.front().unwrap().sequence, 7);
        assert_eq!(state.pending_truncated_events, 6);

        let truncation = state.take_pending_truncation("buffer_limit").unwrap();
        assert_eq!(truncation.truncated_events, 6);
        assert!(state.take_pending_truncation("buffer_limit").is_none());
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_canceled());
    }
}
