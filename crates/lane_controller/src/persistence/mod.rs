//! Durable storage of completed sessions and instance snapshots.
//!
//! Nothing here sits on the routing path: the directory hands finished
//! sessions to a [`SessionWriter`], which retries transient store failures
//! with backoff and buffers records it could not write for a later flush.

mod memory;
mod retry;
mod sqlite;
mod writer;

pub use memory::MemorySessionStore;
pub use retry::{Backoff, RetryPolicy};
pub use sqlite::SqliteSessionStore;
pub use writer::SessionWriter;

use crate::error::PersistenceError;
use crate::registry::InstanceSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lane_protocol::{InstanceId, PlayerId};
use serde::{Deserialize, Serialize};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The player left while placed on an instance.
    Completed,
    /// The player's instance disappeared and they were never re-placed.
    Orphaned,
    /// The player left before being placed anywhere.
    Unassigned,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Orphaned => "orphaned",
            SessionOutcome::Unassigned => "unassigned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "completed" => Some(SessionOutcome::Completed),
            "orphaned" => Some(SessionOutcome::Orphaned),
            "unassigned" => Some(SessionOutcome::Unassigned),
            _ => None,
        }
    }
}

/// Append-only summary of a finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub player: PlayerId,
    /// Last instance the player was on, if any
    pub instance: Option<InstanceId>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub outcome: SessionOutcome,
}

impl SessionRecord {
    pub fn new(
        player: PlayerId,
        instance: Option<InstanceId>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        outcome: SessionOutcome,
    ) -> Self {
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0);
        Self {
            player,
            instance,
            started_at,
            ended_at,
            duration_ms,
            outcome,
        }
    }
}

/// Backing store for session records and the optional instance snapshot table.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Appends one completed session. Records are never updated afterwards.
    async fn append_session(&self, record: &SessionRecord) -> Result<(), PersistenceError>;

    /// Replaces the stored instance snapshot with `instances`.
    async fn replace_instances(&self, instances: &[InstanceSnapshot]) -> Result<(), PersistenceError>;

    /// Completed sessions of one player, oldest first.
    async fn sessions_for_player(&self, player: PlayerId) -> Result<Vec<SessionRecord>, PersistenceError>;

    /// Releases pooled resources.
    async fn close(&self) {}
}
