use super::{RetryPolicy, SessionRecord, SessionStore};
use crate::error::PersistenceError;
use crate::registry::InstanceSnapshot;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Writes completed sessions to a [`SessionStore`] with bounded retries.
///
/// A record whose write ultimately fails is kept in a pending buffer and
/// re-attempted by [`flush_pending`](Self::flush_pending), so a store outage
/// delays durability without losing records.
pub struct SessionWriter {
    store: Arc<dyn SessionStore>,
    policy: RetryPolicy,
    pending: Mutex<VecDeque<SessionRecord>>,
}

impl SessionWriter {
    pub fn new(store: Arc<dyn SessionStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Writes `record`, buffering it for a later flush if every attempt fails.
    pub async fn write(&self, record: SessionRecord) -> Result<(), PersistenceError> {
        match self.write_with_retry(&record).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.lock().push_back(record);
                Err(e)
            }
        }
    }

    async fn write_with_retry(&self, record: &SessionRecord) -> Result<(), PersistenceError> {
        let mut backoff = self.policy.backoff();
        loop {
            match self.store.append_session(record).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Session write for {} failed ({}), retrying in {:?}",
                            record.player, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        let attempts = backoff.retries() + 1;
                        error!(
                            "❌ Giving up on session write for {} after {} attempts: {}",
                            record.player, attempts, e
                        );
                        return Err(PersistenceError::RetriesExhausted {
                            attempts,
                            last: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    error!("❌ Session write for {} failed: {}", record.player, e);
                    return Err(e);
                }
            }
        }
    }

    /// Retries every buffered record once (with the usual backoff).
    ///
    /// Returns how many records were written.
    pub async fn flush_pending(&self) -> usize {
        let batch: Vec<SessionRecord> = self.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return 0;
        }

        let mut written = 0;
        let mut failed = Vec::new();
        for record in batch {
            match self.write_with_retry(&record).await {
                Ok(()) => written += 1,
                Err(_) => failed.push(record),
            }
        }

        let still_pending = failed.len();
        self.pending.lock().extend(failed);
        if written > 0 {
            info!(
                "💾 Flushed {} buffered session record(s), {} still pending",
                written, still_pending
            );
        }
        written
    }

    /// Stores a snapshot of the live instances. Failures are logged only.
    pub async fn snapshot_instances(&self, instances: &[InstanceSnapshot]) {
        if let Err(e) = self.store.replace_instances(instances).await {
            warn!("Instance snapshot not stored: {}", e);
        }
    }
}
