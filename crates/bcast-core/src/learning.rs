//! Per-session memory of proven batch sizes and batch latency.
//!
//! Records expire `ttl` after their last success. Expired records are treated
//! as absent everywhere: reads drop them, updates start over from scratch.
//! State is in-memory; [`LearningStore::save_snapshot`] is the opt-in path to
//! keep it across restarts.

use std::{collections::HashMap, path::Path, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};

use crate::{domain::SessionId, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionLearningRecord {
    pub session_id: SessionId,
    pub max_proven_batch_size: usize,
    pub last_success_at: DateTime<Utc>,
    pub total_successes: u64,
    #[serde(default)]
    pub total_failures: u64,
    pub avg_batch_latency_ms: f64,
    pub success_rate: f64,
}

impl SessionLearningRecord {
    fn fresh(session_id: SessionId, batch_size: usize, latency_ms: f64, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            max_proven_batch_size: batch_size,
            last_success_at: now,
            total_successes: 1,
            total_failures: 0,
            avg_batch_latency_ms: latency_ms,
            success_rate: 1.0,
        }
    }

    pub fn is_expired(&self, ttl: TimeDelta, now: DateTime<Utc>) -> bool {
        now - self.last_success_at > ttl
    }

    fn refresh_rate(&mut self) {
        let total = self.total_successes + self.total_failures;
        self.success_rate = if total == 0 {
            0.0
        } else {
            self.total_successes as f64 / total as f64
        };
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LearningSnapshot {
    saved_at: DateTime<Utc>,
    records: Vec<SessionLearningRecord>,
}

pub struct LearningStore {
    ttl: TimeDelta,
    smoothing: f64,
    records: Mutex<HashMap<SessionId, SessionLearningRecord>>,
}

impl LearningStore {
    /// `smoothing` is the weight of the newest latency sample (0.2 keeps 80% history).
    pub fn new(ttl: Duration, smoothing: f64) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            smoothing,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, session: &SessionId) -> Option<SessionLearningRecord> {
        self.get_at(session, Utc::now()).await
    }

    pub async fn get_at(
        &self,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> Option<SessionLearningRecord> {
        let mut records = self.records.lock().await;
        let expired = records.get(session)?.is_expired(self.ttl, now);
        if expired {
            tracing::debug!(session = %session, "dropping expired learning record");
            records.remove(session);
            return None;
        }
        records.get(session).cloned()
    }

    pub async fn record_success(
        &self,
        session: &SessionId,
        batch_size: usize,
        latency: Duration,
    ) -> SessionLearningRecord {
        self.record_success_at(session, batch_size, latency, Utc::now())
            .await
    }

    /// Fold one successful batch into the session's record and return the result.
    pub async fn record_success_at(
        &self,
        session: &SessionId,
        batch_size: usize,
        latency: Duration,
        now: DateTime<Utc>,
    ) -> SessionLearningRecord {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let mut records = self.records.lock().await;

        match records.get_mut(session) {
            Some(rec) if !rec.is_expired(self.ttl, now) => {
                if batch_size > rec.max_proven_batch_size {
                    tracing::info!(
                        session = %session,
                        previous = rec.max_proven_batch_size,
                        proven = batch_size,
                        "raised proven batch size"
                    );
                    rec.max_proven_batch_size = batch_size;
                }
                rec.total_successes += 1;
                rec.avg_batch_latency_ms = rec.avg_batch_latency_ms * (1.0 - self.smoothing)
                    + latency_ms * self.smoothing;
                rec.last_success_at = now;
                rec.refresh_rate();
                rec.clone()
            }
            _ => {
                let rec =
                    SessionLearningRecord::fresh(session.clone(), batch_size, latency_ms, now);
                records.insert(session.clone(), rec.clone());
                rec
            }
        }
    }

    /// Count a failed batch against a live record. Proven size and recency stay as they are.
    pub async fn record_failure_at(
        &self,
        session: &SessionId,
        now: DateTime<Utc>,
    ) -> Option<SessionLearningRecord> {
        let mut records = self.records.lock().await;
        let rec = records.get_mut(session)?;
        if rec.is_expired(self.ttl, now) {
            records.remove(session);
            return None;
        }
        rec.total_failures += 1;
        rec.refresh_rate();
        Some(rec.clone())
    }

    pub async fn record_failure(&self, session: &SessionId) -> Option<SessionLearningRecord> {
        self.record_failure_at(session, Utc::now()).await
    }

    pub async fn forget(&self, session: &SessionId) -> bool {
        self.records.lock().await.remove(session).is_some()
    }

    /// Drop every expired record, returning how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, rec| !rec.is_expired(self.ttl, now));
        before - records.len()
    }

    /// Live records ordered by session id.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> Vec<SessionLearningRecord> {
        let records = self.records.lock().await;
        let mut out: Vec<_> = records
            .values()
            .filter(|rec| !rec.is_expired(self.ttl, now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    /// Replace records from a snapshot, skipping expired ones. Returns how many were kept.
    pub async fn restore(&self, snapshot: Vec<SessionLearningRecord>, now: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;
        let mut kept = 0usize;
        for rec in snapshot {
            if rec.is_expired(self.ttl, now) {
                continue;
            }
            records.insert(rec.session_id.clone(), rec);
            kept += 1;
        }
        kept
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let now = Utc::now();
        let snapshot = LearningSnapshot {
            saved_at: now,
            records: self.snapshot(now).await,
        };
        let count = snapshot.records.len();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, serde_json::to_vec_pretty(&snapshot)?).await?;
        tracing::info!(path = %path.display(), records = count, "saved learning snapshot");
        Ok(count)
    }

    /// Load a snapshot written by [`Self::save_snapshot`]. A missing file loads nothing.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let bytes = match fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let snapshot: LearningSnapshot = serde_json::from_slice(&bytes)?;
        let kept = self.restore(snapshot.records, Utc::now()).await;
        tracing::info!(path = %path.display(), records = kept, "loaded learning snapshot");
        Ok(kept)
    }
}
