//! Distributed runner lock over Redis.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::error::LockError;
use crate::mirror::keys;

use super::RunnerLock;

/// Renew: extend the TTL only while the stored token still matches.
/// A single script, not GET-then-EXPIRE, so a concurrent release/reacquire
/// can never slip between the check and the write.
const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
else
    return 0
end";

/// Release: compare-and-delete. Never deletes a lock already reacquired by
/// a different owner after this owner's TTL lapsed.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end";

/// TTL-based distributed lock: one `SET NX EX` key per job holding the
/// current owner token.
#[derive(Clone)]
pub struct RedisRunnerLock {
    conn: ConnectionManager,
    renew: redis::Script,
    release: redis::Script,
}

impl RedisRunnerLock {
    /// Connect to the shared lock store.
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(|e| LockError::Unavailable {
            reason: e.to_string(),
        })?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| LockError::Unavailable {
                reason: e.to_string(),
            })?;
        Ok(Self::from_connection(conn))
    }

    /// Build from an existing connection (typically shared with
    /// [`crate::mirror::RedisMirror`]).
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            renew: redis::Script::new(RENEW_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

fn unavailable(e: redis::RedisError) -> LockError {
    LockError::Unavailable {
        reason: e.to_string(),
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl RunnerLock for RedisRunnerLock {
    async fn acquire(
        &self,
        job_id: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        // SET NX EX: created iff absent, atomically, with the TTL attached.
        let created: Option<String> = redis::cmd("SET")
            .arg(keys::runner(job_id))
            .arg(owner_token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(created.is_some())
    }

    async fn renew(
        &self,
        job_id: &str,
        owner_token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .renew
            .key(keys::runner(job_id))
            .arg(owner_token)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(extended == 1)
    }

    async fn release(&self, job_id: &str, owner_token: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(keys::runner(job_id))
            .arg(owner_token)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted == 1)
    }

    async fn has_active_runner(&self, job_id: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(keys::runner(job_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(exists)
    }
}
