// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Coalescing log writer for bursty `remote/progress` notifications.
//!
//! Git workspace preparation emits a progress notification at every coarse
//! milestone. Logging each one individually floods the log at info level
//! during a clone; this groups repeats of the same (session, stage) pair
//! within a short window into one line, flushed explicitly rather than via
//! a timer or drop hook.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::info;

const COALESCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct PendingEntry {
    stage: String,
    message: String,
    count: u32,
    first_seen: Instant,
}

/// Groups repeated progress lines per session, flushed on demand.
#[derive(Default)]
pub struct LogCoalescer {
    pending: HashMap<String, PendingEntry>,
}

impl LogCoalescer {
    pub fn new() -> Self {
        Self { pending: HashMap::new() }
    }

    /// Record a progress event, flushing the previous entry for this
    /// session if it has aged out of the coalescing window or the stage
    /// changed.
    pub fn record(&mut self, session_label: &str, stage: &str, message: &str) {
        match self.pending.get_mut(session_label) {
            Some(entry) if entry.stage == stage && entry.first_seen.elapsed() < COALESCE_WINDOW => {
                entry.count += 1;
                entry.message = message.to_string();
            }
            Some(_) => {
                self.flush_one(session_label);
                self.pending.insert(
                    session_label.to_string(),
                    PendingEntry {
                        stage: stage.to_string(),
                        message: message.to_string(),
                        count: 1,
                        first_seen: Instant::now(),
                    },
                );
            }
            None => {
                self.pending.insert(
                    session_label.to_string(),
                    PendingEntry {
                        stage: stage.to_string(),
                        message: message.to_string(),
                        count: 1,
                        first_seen: Instant::now(),
                    },
                );
            }
        }
    }

    fn flush_one(&mut self, session_label: &str) {
        if let Some(entry) = self.pending.remove(session_label) {
            if entry.count > 1 {
                info!(session = session_label, stage = %entry.stage, repeats = entry.count, "{}", entry.message);
            } else {
                info!(session = session_label, stage = %entry.stage, "{}", entry.message);
            }
        }
    }

    /// Flush every buffered entry. Call on connection close and shutdown.
    pub fn flush_all(&mut self) {
        let labels: Vec<String> = self.pending.keys().cloned().collect();
        for label in labels {
            self.flush_one(&label);
        }
    }

    /// Flush and drop bookkeeping for one session (connection detach).
    pub fn flush_session(&mut self, session_label: &str) {
        self.flush_one(session_label);
    }
}
