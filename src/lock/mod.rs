//! Runner locks — at most one active runner per job.
//!
//! One interface, two implementations chosen at construction time: a
//! distributed TTL-based lock over the shared store, and a process-local
//! lock for single-process deployments. Failing to acquire a lock someone
//! else holds is a normal `Ok(false)` outcome, never an error.

pub mod redis;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;

pub use self::redis::RedisRunnerLock;

/// Owner-token-guarded runner lock.
///
/// Every acquisition attempt carries an opaque owner token; `renew` and
/// `release` only act when the stored token still matches, so a holder
/// whose TTL lapsed can never stomp a lock reacquired by someone else.
#[async_trait]
pub trait RunnerLock: Send + Sync {
    /// Try to take the lock. Returns `Ok(true)` iff this call created it;
    /// `Ok(false)` means another runner is already active.
    async fn acquire(&self, job_id: &str, owner_token: &str, ttl: Duration)
    -> Result<bool, LockError>;

    /// Extend the TTL, only if still held by `owner_token`. The active
    /// runner calls this periodically as a liveness heartbeat; expiry
    /// without renewal lets another process take over after a bounded
    /// outage.
    async fn renew(&self, job_id: &str, owner_token: &str, ttl: Duration)
    -> Result<bool, LockError>;

    /// Drop the lock, only if still held by `owner_token`.
    async fn release(&self, job_id: &str, owner_token: &str) -> Result<bool, LockError>;

    /// Whether any runner currently holds the lock.
    async fn has_active_runner(&self, job_id: &str) -> Result<bool, LockError>;
}

/// Process-local runner lock.
///
/// No TTL: a local holder is alive by definition, and the manager clears
/// the slot when a job reaches a terminal status.
#[derive(Debug, Default)]
pub struct LocalRunnerLock {
    holders: Mutex<HashMap<String, String>>,
}

impl LocalRunnerLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally clear a job's slot (terminal-status bookkeeping).
    pub fn clear(&self, job_id: &str) {
        if let Ok(mut holders) = self.holders.lock() {
            holders.remove(job_id);
        }
    }

    fn poisoned() -> LockError {
        LockError::Unavailable {
            reason: "local lock mutex poisoned".to_string(),
        }
    }
}

#[async_trait]
impl RunnerLock for LocalRunnerLock {
    async fn acquire(
        &self,
        job_id: &str,
        owner_token: &str,
        _ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut holders = self.holders.lock().map_err(|_| Self::poisoned())?;
        if holders.contains_key(job_id) {
            return Ok(false);
        }
        holders.insert(job_id.to_string(), owner_token.to_string());
        Ok(true)
    }

    async fn renew(
        &self,
        job_id: &str,
        owner_token: &str,
        _ttl: Duration,
    ) -> Result<bool, LockError> {
        let holders = self.holders.lock().map_err(|_| Self::poisoned())?;
        Ok(holders.get(job_id).is_some_and(|held| held == owner_token))
    }

    async fn release(&self, job_id: &str, owner_token: &str) -> Result<bool, LockError> {
        let mut holders = self.holders.lock().map_err(|_| Self::poisoned())?;
        if holders.get(job_id).is_some_and(|held| held == owner_token) {
            holders.remove(job_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn has_active_runner(&self, job_id: &str) -> Result<bool, LockError> {
        let holders = self.holders.lock().map_err(|_| Self::poisoned())?;
        Ok(holders.contains_key(job_id))
    }
}
