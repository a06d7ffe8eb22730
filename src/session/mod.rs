// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The session registry: tracks which git workspace and which set of
//! connections belong to each session, and drains sessions that have gone
//! idle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::SessionError;
use crate::git::GitWorkspaceContext;

/// Lifecycle state for a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Has at least one attached connection.
    Active,
    /// No attached connections; eligible for expiry after the idle TTL.
    Draining { since: DrainMark },
    /// Idle TTL elapsed with no re-attach; the record has been removed.
    Expired,
}

/// Opaque drain timestamp, wrapping `Instant` so the enum stays `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainMark(u64);

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub runtime_id: String,
    pub git_context: Option<GitWorkspaceContext>,
    pub subscribers: HashSet<String>,
    state: SessionState,
    drain_started_at: Option<Instant>,
}

/// Tracks live sessions, their runtime binding, and their connection
/// subscriber sets. Mutated only through its own methods.
pub struct SessionRegistry {
    records: RwLock<HashMap<String, SessionRecord>>,
    idle_ttl: Duration,
    drain_counter: std::sync::atomic::AtomicU64,
}

impl SessionRegistry {
    pub fn new(idle_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            idle_ttl,
            drain_counter: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Return the existing record for `session_id`, or create one bound to
    /// `runtime_id`. If the session already exists under a different
    /// runtime, the stored runtime reference is replaced.
    pub async fn ensure(&self, session_id: &str, runtime_id: &str) -> SessionRecord {
        let mut records = self.records.write().await;
        let record = records.entry(session_id.to_string()).or_insert_with(|| SessionRecord {
            session_id: session_id.to_string(),
            runtime_id: runtime_id.to_string(),
            git_context: None,
            subscribers: HashSet::new(),
            state: SessionState::Active,
            drain_started_at: None,
        });
        record.runtime_id = runtime_id.to_string();
        record.clone()
    }

    pub async fn set_git_context(&self, session_id: &str, ctx: GitWorkspaceContext) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            record.git_context = Some(ctx);
        }
    }

    /// Attach a connection to a session, cancelling any pending drain.
    pub async fn attach(&self, session_id: &str, connection_id: &str) -> Result<(), SessionError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        record.subscribers.insert(connection_id.to_string());
        record.state = SessionState::Active;
        record.drain_started_at = None;
        Ok(())
    }

    /// Detach a connection. If no subscribers remain, the session moves to
    /// `Draining` and starts its idle clock.
    pub async fn detach(&self, session_id: &str, connection_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            record.subscribers.remove(connection_id);
            if record.subscribers.is_empty() && record.state == SessionState::Active {
                record.state = SessionState::Draining {
                    since: DrainMark(self.drain_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed)),
                };
                record.drain_started_at = Some(Instant::now());
            }
        }
    }

    /// Mark the session recently used, cancelling any pending drain.
    pub async fn touch(&self, session_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(session_id) {
            if !record.subscribers.is_empty() {
                record.state = SessionState::Active;
                record.drain_started_at = None;
            }
        }
    }

    pub async fn get_subscribers(&self, session_id: &str) -> HashSet<String> {
        self.records
            .read()
            .await
            .get(session_id)
            .map(|r| r.subscribers.clone())
            .unwrap_or_default()
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.records.read().await.get(session_id).cloned()
    }

    /// Whether any session still references `runtime_id` — governs whether
    /// a disconnecting connection should stop its own runtime.
    pub async fn has_sessions_for_runtime(&self, runtime_id: &str) -> bool {
        self.records
            .read()
            .await
            .values()
            .any(|r| r.runtime_id == runtime_id)
    }

    /// Sweep draining sessions whose idle TTL has elapsed, removing them
    /// and returning the removed records (so the caller can tear down
    /// their runtime/worktree if nothing else references them).
    pub async fn sweep_expired(&self) -> Vec<SessionRecord> {
        let mut records = self.records.write().await;
        let mut expired = Vec::new();
        records.retain(|_, record| {
            let should_expire = matches!(record.state, SessionState::Draining { .. })
                && record
                    .drain_started_at
                    .map(|t| t.elapsed() >= self.idle_ttl)
                    .unwrap_or(false);
            if should_expire {
                record.state = SessionState::Expired;
                expired.push(record.clone());
                false
            } else {
                true
            }
        });
        expired
    }
}
