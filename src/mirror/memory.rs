//! In-process mirror backend.
//!
//! Behaves like the shared store (TTL expiry, capped event lists) but lives
//! in one process. Useful for single-process deployments and for tests that
//! share one mirror between several manager instances to exercise
//! cross-process paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::MirrorError;
use crate::jobs::{Event, JobSnapshot};

use super::{MirrorStore, keys, parse_snapshot};

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct ListEntry {
    values: Vec<String>,
    expires_at: Instant,
}

/// Mirror backend backed by in-process hash maps.
#[derive(Debug, Default)]
pub struct MemoryMirror {
    strings: Mutex<HashMap<String, StringEntry>>,
    lists: Mutex<HashMap<String, ListEntry>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> MirrorError {
        MirrorError::Command("mirror mutex poisoned".to_string())
    }
}

#[async_trait]
impl MirrorStore for MemoryMirror {
    async fn save_record(&self, snapshot: &JobSnapshot, ttl: Duration) -> Result<(), MirrorError> {
        let raw = serde_json::to_string(snapshot)?;
        let mut strings = self.strings.lock().map_err(|_| Self::poisoned())?;
        strings.insert(
            keys::record(&snapshot.job_id),
            StringEntry {
                value: raw,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn load_record(&self, job_id: &str) -> Result<Option<JobSnapshot>, MirrorError> {
        let strings = self.strings.lock().map_err(|_| Self::poisoned())?;
        match strings.get(&keys::record(job_id)) {
            Some(entry) if entry.expires_at > Instant::now() => parse_snapshot(&entry.value),
            _ => Ok(None),
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
        let mut lists = self.lists.lock().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        let entry = lists.entry(keys::events(job_id)).or_insert_with(|| ListEntry {
            values: Vec::new(),
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.values.clear();
        }
        entry.values.push(raw);
        // Keep the newest `cap` entries, like LTRIM -cap..-1.
        if entry.values.len() > cap {
            let drop = entry.values.len() - cap;
            entry.values.drain(..drop);
        }
        entry.expires_at = now + ttl;
        Ok(())
    }

    async fn load_events(&self, job_id: &str) -> Result<Vec<Event>, MirrorError> {
        let lists = self.lists.lock().map_err(|_| Self::poisoned())?;
        let Some(entry) = lists.get(&keys::events(job_id)) else {
            return Ok(Vec::new());
        };
        if entry.expires_at <= Instant::now() {
            return Ok(Vec::new());
        }
        entry
            .values
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(MirrorError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::record::JobState;
    use serde_json::json;

    fn snapshot(job_id: &str) -> JobSnapshot {
        JobState::new(job_id, json!({}), "u1", "org-1", None).snapshot()
    }

    #[tokio::test]
    async fn record_roundtrip() {
        let mirror = MemoryMirror::new();
        mirror
            .save_record(&snapshot("job-1"), Duration::from_secs(60))
            .await
            .unwrap();

        let loaded = mirror.load_record("job-1").await.unwrap().unwrap();
        assert_eq!(loaded.job_id, "job-1");
        assert!(mirror.load_record("job-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_record_reads_as_absent() {
        let mirror = MemoryMirror::new();
        mirror
            .save_record(&snapshot("job-1"), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(mirror.load_record("job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_list_is_capped_to_newest() {
        let mirror = MemoryMirror::new();
        for i in 0..10u64 {
            let mut event = Event::new("tick");
            event.sequence = i + 1;
            mirror
                .append_event("job-1", &event, 4, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let events = mirror.load_events("job-1").await.unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events.first().unwrap().sequence, 7);
        assert_eq!(events.last().unwrap().sequence, 10);
    }

    #[tokio::test]
    async fn unknown_schema_version_reads_as_absent() {
        let mirror = MemoryMirror::new();
        let mut snap = snapshot("job-1");
        snap.schema_version = 99;
        // Bypass is_readable by writing the raw form directly.
        let raw = serde_json::to_string(&snap).unwrap();
        mirror.strings.lock().unwrap().insert(
            super::keys::record("job-1"),
            StringEntry {
                value: raw,
                expires_at: Instant::now() + Duration::from_secs(60),
            },
        );
        assert!(mirror.load_record("job-1").await.unwrap().is_none());
    }
}
