use super::{SessionRecord, SessionStore};
use crate::error::PersistenceError;
use crate::registry::InstanceSnapshot;
use async_trait::async_trait;
use lane_protocol::PlayerId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// In-process session store, used when no database is configured.
///
/// `fail_next_writes` makes the next N appends fail with a retryable error,
/// which lets callers exercise their retry paths.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<Vec<SessionRecord>>,
    instances: Mutex<Vec<InstanceSnapshot>>,
    failures: AtomicU32,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.lock().clone()
    }

    pub fn instances(&self) -> Vec<InstanceSnapshot> {
        self.instances.lock().clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn append_session(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PersistenceError::PoolExhausted("injected failure".to_string()));
        }
        self.sessions.lock().push(record.clone());
        Ok(())
    }

    async fn replace_instances(&self, instances: &[InstanceSnapshot]) -> Result<(), PersistenceError> {
        *self.instances.lock() = instances.to_vec();
        Ok(())
    }

    async fn sessions_for_player(&self, player: PlayerId) -> Result<Vec<SessionRecord>, PersistenceError> {
        Ok(self
            .sessions
            .lock()
            .iter()
            .filter(|record| record.player == player)
            .cloned()
            .collect())
    }
}
