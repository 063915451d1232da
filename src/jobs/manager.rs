//! Job manager — the facade owning job records, the event log, and the
//! runner lock.
//!
//! Constructed once at process start and handed out as `Arc<JobManager>`;
//! the HTTP layer drives the lifecycle API, the execution callable reports
//! progress through `append_event`/`set_status` and heartbeats via `renew`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JobManagerConfig;
use crate::error::{Error, JobError, Result};
use crate::lock::{LocalRunnerLock, RunnerLock};
use crate::mirror::MirrorStore;

use super::event::Event;
use super::record::{CancelToken, JobRecord, JobSnapshot, JobState};
use super::status::JobStatus;

/// Metadata keys used by the cancel-request flag.
const META_CANCEL_REQUESTED: &str = "cancel_requested";
const META_CANCEL_REQUESTED_BY: &str = "cancel_requested_by";
const META_CANCEL_REQUESTED_AT: &str = "cancel_requested_at";

/// Partial status update applied under the record's lock.
///
/// `None` fields are left untouched; `pending_approval` distinguishes
/// "don't touch" (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Default, Clone)]
pub struct StatusUpdate {
    pub status: Option<JobStatus>,
    pub phase: Option<String>,
    pub error: Option<String>,
    pub pending_approval: Option<Option<Value>>,
}

impl StatusUpdate {
    /// Update targeting the given status.
    pub fn to(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_pending_approval(mut self, gate: Value) -> Self {
        self.pending_approval = Some(Some(gate));
        self
    }

    pub fn clear_pending_approval(mut self) -> Self {
        self.pending_approval = Some(None);
        self
    }
}

/// Owns the process-local job records and coordinates with the shared
/// mirror and runner lock.
pub struct JobManager {
    config: JobManagerConfig,
    jobs: RwLock<HashMap<String, Arc<JobRecord>>>,
    mirror: Option<Arc<dyn MirrorStore>>,
    shared_lock: Option<Arc<dyn RunnerLock>>,
    local_lock: LocalRunnerLock,
}

impl JobManager {
    /// Local-only manager: no mirror, in-process locking.
    pub fn new(config: JobManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            jobs: RwLock::new(HashMap::new()),
            mirror: None,
            shared_lock: None,
            local_lock: LocalRunnerLock::new(),
        })
    }

    /// Shared-store manager: job state is mirrored, and (when a lock is
    /// also supplied via [`JobManager::with_shared`]) runner exclusivity
    /// holds across processes.
    pub fn with_mirror(config: JobManagerConfig, mirror: Arc<dyn MirrorStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            jobs: RwLock::new(HashMap::new()),
            mirror: Some(mirror),
            shared_lock: None,
            local_lock: LocalRunnerLock::new(),
        })
    }

    /// Shared mirror plus distributed runner lock.
    pub fn with_shared(
        config: JobManagerConfig,
        mirror: Arc<dyn MirrorStore>,
        lock: Arc<dyn RunnerLock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            jobs: RwLock::new(HashMap::new()),
            mirror: Some(mirror),
            shared_lock: Some(lock),
            local_lock: LocalRunnerLock::new(),
        })
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create a new job. The first log entry (`job_created`, sequence 1)
    /// is appended as part of creation.
    ///
    /// Fails with `InvalidArgument` if `user_id` is blank — every job must
    /// be attributable to an owner.
    pub async fn create_job(
        &self,
        payload: Value,
        user_id: &str,
        org_id: &str,
        metadata: Option<serde_json::Map<String, Value>>,
    ) -> Result<JobSnapshot> {
        if user_id.trim().is_empty() {
            return Err(JobError::InvalidArgument {
                reason: "user_id must not be blank".to_string(),
            }
            .into());
        }

        let job_id = Uuid::new_v4().to_string();
        let mut state = JobState::new(&job_id, payload, user_id, org_id, metadata);
        let created = self.append_locked(&mut state, Event::new(Event::JOB_CREATED));
        let snapshot = state.snapshot();
        let record = JobRecord::new(state);

        self.jobs.write().await.insert(job_id.clone(), record);
        self.persist_record(&snapshot).await;
        self.persist_event(&job_id, &created).await;

        info!(job_id = %job_id, user_id, org_id, "Job created");
        Ok(snapshot)
    }

    /// Get a job's current snapshot, or `None` if unknown everywhere.
    ///
    /// A process-local record is refreshed from the mirror first (so
    /// cross-process writes become visible); an unknown job is hydrated
    /// from the mirror as a shadow copy if present there.
    pub async fn get_job(&self, job_id: &str) -> Option<JobSnapshot> {
        let record = self.record(job_id).await?;
        let state = record.state.lock().await;
        Some(state.snapshot())
    }

    /// Like [`JobManager::get_job`], but fails with `NotFound`.
    pub async fn require_job(&self, job_id: &str) -> Result<JobSnapshot> {
        self.get_job(job_id).await.ok_or_else(|| {
            JobError::NotFound {
                id: job_id.to_string(),
            }
            .into()
        })
    }

    /// Apply a partial status update under the record's lock.
    ///
    /// A terminal status is immutable: further status changes are ignored
    /// (not errors). Entering a terminal status clears local lock
    /// bookkeeping; entering `canceled` also trips the cancel token.
    pub async fn set_status(&self, job_id: &str, update: StatusUpdate) -> Result<JobSnapshot> {
        let record = self.require_record(job_id).await?;
        let snapshot = {
            let mut state = record.state.lock().await;

            if let Some(status) = update.status {
                if state.status.is_terminal() {
                    debug!(
                        job_id,
                        current = %state.status,
                        requested = %status,
                        "Ignoring status change on terminal job"
                    );
                } else {
                    if !state.status.can_transition_to(status) {
                        warn!(
                            job_id,
                            from = %state.status,
                            to = %status,
                            "Unexpected status transition"
                        );
                    }
                    state.status = status;
                    if status == JobStatus::Canceled {
                        record.cancel.cancel();
                    }
                    if status.is_terminal() {
                        self.local_lock.clear(job_id);
                        record.detach_runner();
                    }
                }
            }
            if let Some(phase) = update.phase {
                state.phase = phase;
            }
            if let Some(error) = update.error {
                state.error = Some(error);
            }
            if let Some(gate) = update.pending_approval {
                if !state.status.is_terminal() {
                    state.pending_approval = gate;
                }
            }
            state.updated_at = Utc::now();
            state.snapshot()
        };

        self.persist_record(&snapshot).await;
        record.notify.notify_waiters();
        Ok(snapshot)
    }

    /// Shallow-merge a metadata patch, last write wins per key. No
    /// cross-field atomicity is promised.
    pub async fn update_metadata(
        &self,
        job_id: &str,
        patch: serde_json::Map<String, Value>,
    ) -> Result<JobSnapshot> {
        let record = self.require_record(job_id).await?;
        let snapshot = {
            let mut state = record.state.lock().await;
            for (key, value) in patch {
                state.metadata.insert(key, value);
            }
            state.updated_at = Utc::now();
            state.snapshot()
        };
        self.persist_record(&snapshot).await;
        Ok(snapshot)
    }

    /// Record a cancel request in metadata (requester + timestamp).
    ///
    /// This only flips shared state; the owning runner observes the flag
    /// (or its lock expires) before work actually stops.
    pub async fn request_cancel(&self, job_id: &str, requested_by: &str) -> Result<JobSnapshot> {
        let mut patch = serde_json::Map::new();
        patch.insert(META_CANCEL_REQUESTED.to_string(), json!(true));
        patch.insert(META_CANCEL_REQUESTED_BY.to_string(), json!(requested_by));
        patch.insert(
            META_CANCEL_REQUESTED_AT.to_string(),
            json!(Utc::now().to_rfc3339()),
        );
        info!(job_id, requested_by, "Cancel requested");
        self.update_metadata(job_id, patch).await
    }

    /// Clear a previously recorded cancel request.
    pub async fn clear_cancel_request(&self, job_id: &str) -> Result<JobSnapshot> {
        let record = self.require_record(job_id).await?;
        let snapshot = {
            let mut state = record.state.lock().await;
            state.metadata.remove(META_CANCEL_REQUESTED);
            state.metadata.remove(META_CANCEL_REQUESTED_BY);
            state.metadata.remove(META_CANCEL_REQUESTED_AT);
            state.updated_at = Utc::now();
            state.snapshot()
        };
        self.persist_record(&snapshot).await;
        Ok(snapshot)
    }

    /// Whether a cancel request is currently recorded. A job that is
    /// already `canceled` counts: a runner polling this flag stops even
    /// when the cancel skipped the request metadata.
    pub async fn is_cancel_requested(&self, job_id: &str) -> Result<bool> {
        let snapshot = self.require_job(job_id).await?;
        Ok(snapshot.status == JobStatus::Canceled
            || snapshot
                .metadata
                .get(META_CANCEL_REQUESTED)
                .and_then(Value::as_bool)
                .unwrap_or(false))
    }

    /// Cancel a job. Idempotent: a terminal job is left untouched.
    ///
    /// Sets `canceled`, clears any pending approval gate, trips the local
    /// cancel token, and appends exactly one `job_canceled` event.
    pub async fn cancel_job(&self, job_id: &str) -> Result<JobSnapshot> {
        let record = self.require_record(job_id).await?;
        let (snapshot, canceled_event) = {
            let mut state = record.state.lock().await;
            if state.status.is_terminal() {
                debug!(job_id, status = %state.status, "cancel_job on terminal job is a no-op");
                return Ok(state.snapshot());
            }

            state.status = JobStatus::Canceled;
            state.phase = "canceled".to_string();
            state.pending_approval = None;
            state.updated_at = Utc::now();

            let event = self.append_locked(&mut state, Event::new(Event::JOB_CANCELED));
            (state.snapshot(), event)
        };

        record.cancel.cancel();
        record.detach_runner();
        self.local_lock.clear(job_id);

        self.persist_record(&snapshot).await;
        self.persist_event(job_id, &canceled_event).await;
        record.notify.notify_waiters();

        info!(job_id, "Job canceled");
        Ok(snapshot)
    }

    /// Drop the process-local shadow of a job. The mirrored copy (if any)
    /// lives on until its TTL expires.
    pub async fn delete_local(&self, job_id: &str) {
        if let Some(record) = self.jobs.write().await.remove(job_id) {
            record.detach_runner();
        }
        self.local_lock.clear(job_id);
    }

    /// Ids of all process-local records (diagnostics).
    pub async fn list_jobs(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }

    // ── Event log ───────────────────────────────────────────────────

    /// Append an event to the job's log.
    ///
    /// Stamps sequence/job_id/status-snapshot/timestamp, deep-truncates
    /// oversized payloads, evicts the oldest local events past the buffer
    /// bounds, mirrors the record and the event, and wakes local waiters.
    /// Returns the stamped event.
    pub async fn append_event(&self, job_id: &str, event: Event) -> Result<Event> {
        let record = self.require_record(job_id).await?;
        let (snapshot, stamped) = {
            let mut state = record.state.lock().await;
            state.updated_at = Utc::now();
            let stamped = self.append_locked(&mut state, event);
            (state.snapshot(), stamped)
        };

        self.persist_record(&snapshot).await;
        self.persist_event(job_id, &stamped).await;
        record.notify.notify_waiters();

        debug!(job_id, sequence = stamped.sequence, kind = %stamped.kind, "Event appended");
        Ok(stamped)
    }

    /// All buffered events with `sequence > after_sequence`.
    ///
    /// Locally trimmed events are gone even if never delivered; consumers
    /// must tolerate gaps but can trust monotonic, duplicate-free numbering.
    pub async fn get_events_after(&self, job_id: &str, after_sequence: u64) -> Result<Vec<Event>> {
        let record = self.require_record(job_id).await?;
        let state = record.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.sequence > after_sequence)
            .cloned()
            .collect())
    }

    /// Long-poll for events past `after_sequence`.
    ///
    /// Returns immediately when events are already available or the job is
    /// terminal (so resuming clients drain the terminal event and can be
    /// handed an end-of-stream marker without burning the timeout).
    /// Otherwise waits in short slices, re-checking the mirror each slice
    /// so cross-process appends are noticed, and returns whatever exists
    /// at the deadline — possibly nothing.
    pub async fn wait_for_events(
        &self,
        job_id: &str,
        after_sequence: u64,
        timeout: Duration,
    ) -> Result<Vec<Event>> {
        let deadline = Instant::now() + timeout;
        loop {
            let record = self.require_record(job_id).await?;
            let (events, terminal) = {
                let state = record.state.lock().await;
                let events: Vec<Event> = state
                    .events
                    .iter()
                    .filter(|e| e.sequence > after_sequence)
                    .cloned()
                    .collect();
                (events, state.status.is_terminal())
            };
            if !events.is_empty() || terminal {
                return Ok(events);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let slice = self.config.wait_slice.min(deadline - now);
            let _ = tokio::time::timeout(slice, record.notify.notified()).await;
        }
    }

    // ── Runner lock ─────────────────────────────────────────────────

    /// Try to become the job's active runner. `Ok(false)` means a runner
    /// is already active — a normal outcome, not an error.
    ///
    /// With a shared lock configured, store failures fail closed with
    /// `LockError::Unavailable` unless `degrade_locking` opted into
    /// local-only fallback.
    pub async fn acquire(&self, job_id: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        match &self.shared_lock {
            Some(lock) => match lock.acquire(job_id, owner_token, ttl).await {
                Ok(won) => Ok(won),
                Err(e) => {
                    self.degraded(job_id, "acquire", e)?;
                    Ok(self.local_lock.acquire(job_id, owner_token, ttl).await?)
                }
            },
            None => Ok(self.local_lock.acquire(job_id, owner_token, ttl).await?),
        }
    }

    /// Heartbeat: extend the lock TTL while still the holder.
    pub async fn renew(&self, job_id: &str, owner_token: &str, ttl: Duration) -> Result<bool> {
        match &self.shared_lock {
            Some(lock) => match lock.renew(job_id, owner_token, ttl).await {
                Ok(renewed) => Ok(renewed),
                Err(e) => {
                    self.degraded(job_id, "renew", e)?;
                    Ok(self.local_lock.renew(job_id, owner_token, ttl).await?)
                }
            },
            None => Ok(self.local_lock.renew(job_id, owner_token, ttl).await?),
        }
    }

    /// Release the lock if still the holder.
    pub async fn release(&self, job_id: &str, owner_token: &str) -> Result<bool> {
        match &self.shared_lock {
            Some(lock) => match lock.release(job_id, owner_token).await {
                Ok(released) => Ok(released),
                Err(e) => {
                    self.degraded(job_id, "release", e)?;
                    Ok(self.local_lock.release(job_id, owner_token).await?)
                }
            },
            None => Ok(self.local_lock.release(job_id, owner_token).await?),
        }
    }

    /// Whether any runner is currently active for the job.
    pub async fn has_active_runner(&self, job_id: &str) -> Result<bool> {
        if let Some(lock) = &self.shared_lock {
            match lock.has_active_runner(job_id).await {
                Ok(active) => return Ok(active),
                Err(e) => self.degraded(job_id, "has_active_runner", e)?,
            }
        }
        if self.local_lock.has_active_runner(job_id).await? {
            return Ok(true);
        }
        let jobs = self.jobs.read().await;
        Ok(jobs.get(job_id).is_some_and(|r| r.has_live_runner()))
    }

    // ── Runner attachment ───────────────────────────────────────────

    /// Acquire the runner lock and, if won, spawn the execution callable.
    ///
    /// The callable receives the job's cancel token and is expected to
    /// report progress via `append_event`/`set_status` and to heartbeat
    /// with `renew`. If it returns an error before the job went terminal,
    /// the job is marked failed with that error. The lock is released on
    /// the way out. Returns `Ok(false)` when a runner was already active
    /// or the job is already terminal.
    pub async fn spawn_runner<F>(
        self: Arc<Self>,
        job_id: &str,
        owner_token: &str,
        ttl: Duration,
        run: F,
    ) -> Result<bool>
    where
        F: FnOnce(CancelToken) -> BoxFuture<'static, anyhow::Result<()>>,
    {
        let snapshot = self.require_job(job_id).await?;
        if snapshot.status.is_terminal() {
            debug!(job_id, status = %snapshot.status, "Not starting runner for terminal job");
            return Ok(false);
        }
        if !self.acquire(job_id, owner_token, ttl).await? {
            debug!(job_id, "Runner already active");
            return Ok(false);
        }

        self.set_status(job_id, StatusUpdate::to(JobStatus::Running).with_phase("running"))
            .await?;

        let record = self.require_record(job_id).await?;
        let token = record.cancel.clone();
        let manager = Arc::clone(&self);
        let job_id_owned = job_id.to_string();
        let owner = owner_token.to_string();

        let fut = run(token);
        let handle = tokio::spawn(async move {
            let result = fut.await;
            if let Err(e) = &result {
                let still_running = manager
                    .get_job(&job_id_owned)
                    .await
                    .is_some_and(|s| !s.status.is_terminal());
                if still_running {
                    warn!(job_id = %job_id_owned, error = %e, "Runner failed");
                    let _ = manager
                        .set_status(
                            &job_id_owned,
                            StatusUpdate::to(JobStatus::Failed).with_error(e.to_string()),
                        )
                        .await;
                }
            }
            if let Err(e) = manager.release(&job_id_owned, &owner).await {
                warn!(job_id = %job_id_owned, error = %e, "Lock release failed after run");
            }
        });

        if let Ok(mut runner) = record.runner.lock() {
            *runner = Some(handle);
        }
        info!(job_id, "Runner started");
        Ok(true)
    }

    /// Attach an externally spawned runner task to the job's local record.
    pub async fn attach_runner(&self, job_id: &str, handle: tokio::task::JoinHandle<()>) -> Result<()> {
        let record = self.require_record(job_id).await?;
        if let Ok(mut runner) = record.runner.lock() {
            *runner = Some(handle);
        }
        Ok(())
    }

    /// The job's cooperative cancel token, if the job is known here.
    pub async fn cancel_token(&self, job_id: &str) -> Option<CancelToken> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(|record| record.cancel.clone())
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Stamp and buffer an event under the record's lock (no I/O).
    fn append_locked(&self, state: &mut JobState, mut event: Event) -> Event {
        event.sequence = state.next_sequence;
        state.next_sequence += 1;
        event.job_id = state.job_id.clone();
        event.job_status = state.status;
        event.timestamp = Utc::now();

        let shaved = event.truncate_payload(self.config.max_event_bytes);
        let mut reasons = Vec::new();
        if state.pending_truncated_events > 0 {
            reasons.push("buffer_limit");
        }
        if shaved > 0 {
            state.pending_truncated_bytes += shaved;
            reasons.push("payload_too_large");
        }
        if !reasons.is_empty() {
            event.truncation = state.take_pending_truncation(&reasons.join(","));
        }

        state.event_bytes += event.serialized_len();
        state.events.push_back(event.clone());
        state.enforce_bounds(self.config.max_events, self.config.max_event_log_bytes);
        event
    }

    /// Degrade-or-fail-closed policy for lock-store errors.
    fn degraded(&self, job_id: &str, op: &str, e: crate::error::LockError) -> Result<()> {
        if self.config.degrade_locking {
            warn!(job_id, op, error = %e, "Lock store unavailable, degrading to local-only locking");
            Ok(())
        } else {
            warn!(job_id, op, error = %e, "Lock store unavailable, failing closed");
            Err(e.into())
        }
    }

    /// Look up (and refresh) the local record, or hydrate a shadow copy
    /// from the mirror.
    async fn record(&self, job_id: &str) -> Option<Arc<JobRecord>> {
        let local = self.jobs.read().await.get(job_id).cloned();
        if let Some(record) = local {
            self.refresh_record(job_id, &record).await;
            return Some(record);
        }

        let mirror = self.mirror.as_ref()?;
        let snapshot = match mirror.load_record(job_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                warn!(job_id, error = %e, "Mirror read failed, job unknown locally");
                return None;
            }
        };
        let events = match mirror.load_events(job_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!(job_id, error = %e, "Mirror event read failed, hydrating without events");
                Vec::new()
            }
        };

        debug!(job_id, next_sequence = snapshot.next_sequence, "Hydrated shadow record from mirror");
        let record = JobRecord::new(JobState::from_snapshot(snapshot, events));

        let mut jobs = self.jobs.write().await;
        // Another task may have hydrated concurrently; keep the first one.
        Some(Arc::clone(jobs.entry(job_id.to_string()).or_insert(record)))
    }

    async fn require_record(&self, job_id: &str) -> Result<Arc<JobRecord>> {
        self.record(job_id).await.ok_or_else(|| {
            Error::from(JobError::NotFound {
                id: job_id.to_string(),
            })
        })
    }

    /// Pull cross-process writes into a local record. Mutable fields adopt
    /// the mirror copy; events and the sequence counter only move forward,
    /// and only when the mirror is strictly ahead.
    async fn refresh_record(&self, job_id: &str, record: &JobRecord) {
        let Some(mirror) = &self.mirror else { return };

        let snapshot = match mirror.load_record(job_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id, error = %e, "Mirror refresh failed, serving local state");
                return;
            }
        };

        let mirror_ahead = {
            let state = record.state.lock().await;
            snapshot.next_sequence > state.next_sequence
        };
        let events = if mirror_ahead {
            match mirror.load_events(job_id).await {
                Ok(events) => Some(events),
                Err(e) => {
                    warn!(job_id, error = %e, "Mirror event refresh failed, keeping local buffer");
                    None
                }
            }
        } else {
            None
        };

        let (status, was_terminal) = {
            let mut state = record.state.lock().await;
            let was_terminal = state.status.is_terminal();
            let next_sequence = snapshot.next_sequence;
            state.refresh_from(snapshot);
            if let Some(events) = events {
                // Re-check under the lock; a local append may have caught up.
                if next_sequence > state.next_sequence {
                    state.adopt_events(events, next_sequence);
                }
            }
            (state.status, was_terminal)
        };

        // A terminal status adopted from another process gets the same
        // local side effects as an in-process transition, so a runner
        // parked on the cancel token still observes a remote cancel.
        if status.is_terminal() && !was_terminal {
            if status == JobStatus::Canceled {
                record.cancel.cancel();
            }
            self.local_lock.clear(job_id);
            record.detach_runner();
            record.notify.notify_waiters();
        }
    }

    /// Best-effort mirror write of the record snapshot.
    async fn persist_record(&self, snapshot: &JobSnapshot) {
        let Some(mirror) = &self.mirror else { return };
        if let Err(e) = mirror.save_record(snapshot, self.config.record_ttl).await {
            warn!(job_id = %snapshot.job_id, error = %e, "Mirror write failed, continuing local-only");
        }
    }

    /// Best-effort mirror write of one event.
    async fn persist_event(&self, job_id: &str, event: &Event) {
        let Some(mirror) = &self.mirror else { return };
        if let Err(e) = mirror
            .append_event(job_id, event, self.config.mirror_event_cap, self.config.record_ttl)
            .await
        {
            warn!(job_id, sequence = event.sequence, error = %e, "Mirror event write failed, continuing local-only");
        }
    }
}
