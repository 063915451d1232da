//! Redis mirror backend.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::MirrorError;
use crate::jobs::{Event, JobSnapshot};

use super::{MirrorStore, keys, parse_snapshot};

/// Mirror backend over a shared Redis instance.
///
/// Uses a multiplexed auto-reconnecting connection; every write refreshes
/// the key TTL so live jobs never age out mid-flight.
#[derive(Clone)]
pub struct RedisMirror {
    conn: ConnectionManager,
}

impl RedisMirror {
    /// Connect to the shared store, e.g. `redis://localhost:6379`.
    pub async fn connect(url: &str) -> Result<Self, MirrorError> {
        let client = redis::Client::open(url).map_err(MirrorError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(MirrorError::from)?;
        tracing::info!("Connected job mirror to redis");
        Ok(Self { conn })
    }

    /// Build from an existing connection (shared with the runner lock).
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// The underlying connection, for wiring up a
    /// [`crate::lock::RedisRunnerLock`] against the same instance.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl MirrorStore for RedisMirror {
    async fn save_record(&self, snapshot: &JobSnapshot, ttl: Duration) -> Result<(), MirrorError> {
        let raw = serde_json::to_string(snapshot)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(keys::record(&snapshot.job_id), raw, ttl_secs(ttl))
            .await?;
        Ok(())
    }

    async fn load_record(&self, job_id: &str) -> Result<Option<JobSnapshot>, MirrorError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::record(job_id)).await?;
        match raw {
            Some(raw) => parse_snapshot(&raw),
            None => Ok(None),
        }
    }

    async fn append_event(
        &self,
        job_id: &str,
        event: &Event,
        cap: usize,
        ttl: Duration,
    ) -> Result<(), MirrorError> {
        let raw = serde_json::to_string(event)?;
        let key = keys::events(job_id);
        let mut conn = self.conn.clone();
        // RPUSH + LTRIM to the newest `cap` + TTL refresh, in one round trip.
        redis::pipe()
            .rpush(&key, raw)
            .ignore()
            .ltrim(&key, -(cap as isize), -1)
            .ignore()
            .expire(&key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn load_events(&self, job_id: &str) -> Result<Vec<Event>, MirrorError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(keys::events(job_id), 0, -1).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(MirrorError::from))
            .collect()
    }
}
