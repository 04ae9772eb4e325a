//! Persisted run-state of a session worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::SessionId;

/// Snapshot of a worker's run-state, persisted alongside its queue.
///
/// `is_active` records whether the worker was draining at the time of the
/// snapshot, so a restart can distinguish "was running" from "was paused".
/// Deserializing this never starts a worker by itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRunState {
    pub session: SessionId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl WorkerRunState {
    pub fn new(session: SessionId, is_active: bool, created_at: DateTime<Utc>) -> Self {
        Self {
            session,
            is_active,
            created_at,
        }
    }
}
