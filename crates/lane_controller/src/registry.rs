//! Authoritative table of registered instances.
//!
//! Each instance lives in its own `DashMap` entry; every mutation takes that
//! entry's lock, so writes to one instance serialize while different instances
//! proceed independently. Observers are notified only after the entry lock is
//! released and may therefore call back into the registry.
//!
//! Occupancy is tracked from two sides. `assigned` counts players the
//! controller placed on the instance, `reported` is the last occupancy the
//! instance announced in STATE_UPDATE. The effective occupancy is the larger
//! of the two, which keeps capacity checks honest when players arrive through
//! another path without double counting the ones the controller sent.

use crate::error::{ControllerError, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lane_protocol::{HealthStatus, InstanceDescriptor, InstanceId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Instance lifecycle.
///
/// `Registering → Available ⇄ Full → Closing → Closed`. Only `Available`
/// instances receive new reservations; `Closing` lets existing sessions drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Registering,
    Available,
    Full,
    Closing,
    Closed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Registering => "registering",
            Lifecycle::Available => "available",
            Lifecycle::Full => "full",
            Lifecycle::Closing => "closing",
            Lifecycle::Closed => "closed",
        }
    }
}

/// Why an instance left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Deregistered,
    HeartbeatTimeout,
    /// A new registration took over a stale entry with the same id.
    Replaced,
    /// Removed after an internal accounting invariant broke.
    Quarantined,
    /// Finished draining after `Closing`.
    Closed,
}

/// Point-in-time copy of an instance record.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub game_type: String,
    pub address: String,
    pub capacity: u32,
    /// Effective occupancy (see module docs)
    pub occupancy: u32,
    /// Players placed here by the controller
    pub assigned: u32,
    /// Occupancy last reported by the instance
    pub reported: u32,
    /// Slots held for routing requests awaiting ROUTE_ACK
    pub reserved: u32,
    pub private: bool,
    pub metadata: HashMap<String, String>,
    pub lifecycle: Lifecycle,
    pub health: HealthStatus,
    /// Monotonic registration order, used for deterministic tie-breaks
    pub registration_seq: u64,
    pub registered_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_heartbeat: Instant,
}

impl InstanceSnapshot {
    /// Slots neither occupied nor reserved.
    pub fn free_slots(&self) -> u32 {
        self.capacity
            .saturating_sub(self.occupancy.saturating_add(self.reserved))
    }

    pub fn is_routable(&self) -> bool {
        self.lifecycle == Lifecycle::Available && self.health.is_routable()
    }
}

/// Result of applying a sequenced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Sequence number not newer than the last applied one; nothing changed.
    Stale,
}

/// Occupancy report carried by STATE_UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    pub occupancy: u32,
    pub capacity: u32,
    pub closing: bool,
}

/// Receives registry change notifications.
///
/// Called synchronously after the registry has released its locks.
pub trait RegistryObserver: Send + Sync {
    fn on_instance_changed(&self, _instance: &InstanceId) {}

    fn on_instance_evicted(&self, instance: &InstanceSnapshot, reason: EvictionReason);
}

/// Selects instances in [`InstanceRegistry::query`].
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub game_type: Option<String>,
    pub lifecycle: Option<Lifecycle>,
    pub min_free_slots: u32,
    pub include_private: bool,
}

impl InstanceFilter {
    pub fn all() -> Self {
        Self {
            include_private: true,
            ..Self::default()
        }
    }

    pub fn game_type(game_type: impl Into<String>) -> Self {
        Self {
            game_type: Some(game_type.into()),
            ..Self::default()
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn with_free_slots(mut self, slots: u32) -> Self {
        self.min_free_slots = slots;
        self
    }

    pub fn including_private(mut self) -> Self {
        self.include_private = true;
        self
    }

    fn matches(&self, snapshot: &InstanceSnapshot) -> bool {
        if let Some(game_type) = &self.game_type {
            if &snapshot.game_type != game_type {
                return false;
            }
        }
        if let Some(lifecycle) = self.lifecycle {
            if snapshot.lifecycle != lifecycle {
                return false;
            }
        }
        if snapshot.private && !self.include_private {
            return false;
        }
        snapshot.free_slots() >= self.min_free_slots
    }
}

/// Instances removed by one [`InstanceRegistry::sweep_at`] pass.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub expired: Vec<InstanceId>,
    pub closed: Vec<InstanceId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.closed.is_empty()
    }
}

struct InstanceEntry {
    descriptor: InstanceDescriptor,
    id: InstanceId,
    capacity: u32,
    assigned: u32,
    reported: u32,
    reserved: u32,
    lifecycle: Lifecycle,
    health: HealthStatus,
    registration_seq: u64,
    registered_at: DateTime<Utc>,
    last_heartbeat: Instant,
    last_seq: u64,
}

impl InstanceEntry {
    fn occupancy(&self) -> u32 {
        self.assigned.max(self.reported)
    }

    fn committed(&self) -> u32 {
        self.occupancy().saturating_add(self.reserved)
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.checked_duration_since(self.last_heartbeat)
            .is_some_and(|silence| silence > timeout)
    }

    fn is_drained(&self) -> bool {
        self.occupancy() == 0 && self.reserved == 0
    }

    /// Recomputes `Available`/`Full`; other states are left alone.
    fn refresh_lifecycle(&mut self) {
        if matches!(self.lifecycle, Lifecycle::Available | Lifecycle::Full) {
            self.lifecycle = if self.committed() >= self.capacity {
                Lifecycle::Full
            } else {
                Lifecycle::Available
            };
        }
    }

    /// Fails unless the instance can take `seats` more players right now.
    fn ensure_room(&self, seats: u32) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Available | Lifecycle::Full => {}
            lifecycle => {
                return Err(ControllerError::NotJoinable {
                    instance: self.id.clone(),
                    lifecycle,
                })
            }
        }
        if self.committed().saturating_add(seats) > self.capacity {
            return Err(ControllerError::CapacityExceeded {
                instance: self.id.clone(),
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            game_type: self.descriptor.game_type.clone(),
            address: self.descriptor.address.clone(),
            capacity: self.capacity,
            occupancy: self.occupancy(),
            assigned: self.assigned,
            reported: self.reported,
            reserved: self.reserved,
            private: self.descriptor.private,
            metadata: self.descriptor.metadata.clone(),
            lifecycle: self.lifecycle,
            health: self.health,
            registration_seq: self.registration_seq,
            registered_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// The instance registry.
///
/// Every game-server instance the controller knows about lives here, keyed by
/// its id. Each entry is guarded by its own shard lock, so updates to
/// different instances never contend and a check-then-mutate on one instance
/// (reserve, commit, occupy) is atomic.
///
/// Observers registered with [`subscribe`](Self::subscribe) are held weakly
/// and are notified after the entry lock has been released.
///
/// # Examples
///
/// ```rust
/// use lane_controller::{InstanceDescriptor, InstanceRegistry, Lifecycle};
/// use std::time::Duration;
///
/// # fn main() -> lane_controller::Result<()> {
/// let registry = InstanceRegistry::new(Duration::from_secs(15));
/// let id = registry.register(InstanceDescriptor::new("lobby", "10.0.0.5:25565", 2))?;
/// registry.activate(&id)?;
///
/// registry.reserve(&id, 2)?;
/// assert_eq!(registry.snapshot(&id)?.lifecycle, Lifecycle::Full);
///
/// registry.release(&id, 2)?;
/// assert_eq!(registry.snapshot(&id)?.lifecycle, Lifecycle::Available);
/// # Ok(())
/// # }
/// ```
pub struct InstanceRegistry {
    instances: DashMap<InstanceId, InstanceEntry>,
    observers: RwLock<Vec<Weak<dyn RegistryObserver>>>,
    heartbeat_timeout: Duration,
    next_registration: AtomicU64,
}

impl InstanceRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            instances: DashMap::new(),
            observers: RwLock::new(Vec::new()),
            heartbeat_timeout,
            next_registration: AtomicU64::new(1),
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Subscribes an observer. The registry holds it weakly.
    pub fn subscribe<O: RegistryObserver + 'static>(&self, observer: &Arc<O>) {
        let weak: Weak<dyn RegistryObserver> = Arc::downgrade(observer) as Weak<dyn RegistryObserver>;
        self.observers.write().push(weak);
    }

    fn observers(&self) -> Vec<Arc<dyn RegistryObserver>> {
        self.observers.read().iter().filter_map(Weak::upgrade).collect()
    }

    fn notify_changed(&self, id: &InstanceId) {
        for observer in self.observers() {
            observer.on_instance_changed(id);
        }
    }

    fn notify_evicted(&self, snapshot: &InstanceSnapshot, reason: EvictionReason) {
        for observer in self.observers() {
            observer.on_instance_changed(&snapshot.id);
            observer.on_instance_evicted(snapshot, reason);
        }
    }

    pub fn register(&self, descriptor: InstanceDescriptor) -> Result<InstanceId> {
        self.register_at(descriptor, 0, Instant::now())
    }

    /// Admits an instance in `Registering` state.
    ///
    /// `seq` is the sequence number of the REGISTER frame, or 0 when the
    /// registration did not arrive over the protocol. A duplicate id is only
    /// accepted when the existing entry's heartbeat has expired, in which case
    /// the stale entry is evicted first.
    pub fn register_at(&self, descriptor: InstanceDescriptor, seq: u64, now: Instant) -> Result<InstanceId> {
        validate_descriptor(&descriptor)?;

        let id = descriptor.id.clone().unwrap_or_else(InstanceId::generate);
        let entry = InstanceEntry {
            id: id.clone(),
            capacity: descriptor.capacity,
            descriptor,
            assigned: 0,
            reported: 0,
            reserved: 0,
            lifecycle: Lifecycle::Registering,
            health: HealthStatus::Healthy,
            registration_seq: self.next_registration.fetch_add(1, Ordering::SeqCst),
            registered_at: Utc::now(),
            last_heartbeat: now,
            last_seq: seq,
        };
        let game_type = entry.descriptor.game_type.clone();
        let capacity = entry.capacity;

        let replaced = match self.instances.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now, self.heartbeat_timeout) {
                    warn!("🚫 Duplicate registration for healthy instance {}", id);
                    return Err(ControllerError::DuplicateRegistration(id));
                }
                let stale = occupied.insert(entry);
                Some(stale.snapshot())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                None
            }
        };

        if let Some(stale) = replaced {
            info!("♻️ Replacing stale registration of instance {}", id);
            self.notify_evicted(&stale, EvictionReason::Replaced);
        }
        self.notify_changed(&id);

        info!(
            "🆕 Instance {} registered (game type: {}, capacity: {})",
            id, game_type, capacity
        );
        Ok(id)
    }

    /// Moves a `Registering` instance to `Available`. No-op in any other state.
    pub fn activate(&self, id: &InstanceId) -> Result<Lifecycle> {
        let lifecycle = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            if entry.lifecycle == Lifecycle::Registering {
                entry.lifecycle = Lifecycle::Available;
                entry.refresh_lifecycle();
                info!("✅ Instance {} is accepting players", id);
            }
            entry.lifecycle
        };
        self.notify_changed(id);
        Ok(lifecycle)
    }

    pub fn heartbeat(&self, id: &InstanceId, seq: u64, status: HealthStatus) -> Result<UpdateOutcome> {
        self.heartbeat_at(id, seq, status, Instant::now())
    }

    /// Refreshes an instance's freshness timestamp and records its health.
    ///
    /// The first heartbeat activates a `Registering` instance.
    pub fn heartbeat_at(
        &self,
        id: &InstanceId,
        seq: u64,
        status: HealthStatus,
        now: Instant,
    ) -> Result<UpdateOutcome> {
        let health_changed = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            if seq != 0 {
                if seq <= entry.last_seq {
                    debug!("Dropping stale heartbeat from {} (seq {} <= {})", id, seq, entry.last_seq);
                    return Ok(UpdateOutcome::Stale);
                }
                entry.last_seq = seq;
            }
            entry.last_heartbeat = now;
            let previous = entry.health;
            entry.health = status;
            if entry.lifecycle == Lifecycle::Registering {
                entry.lifecycle = Lifecycle::Available;
                entry.refresh_lifecycle();
                info!("✅ Instance {} is accepting players", id);
            }
            previous != status
        };

        if health_changed {
            info!("🩺 Instance {} health is now {:?}", id, status);
        }
        self.notify_changed(id);
        Ok(UpdateOutcome::Applied)
    }

    pub fn apply_state_update(&self, id: &InstanceId, seq: u64, update: StateUpdate) -> Result<UpdateOutcome> {
        self.apply_state_update_at(id, seq, update, Instant::now())
    }

    /// Applies an occupancy/capacity report from the instance.
    ///
    /// Idempotent: an update whose `seq` is not newer than the last applied
    /// one changes nothing. `closing` moves the instance to `Closing` for good.
    pub fn apply_state_update_at(
        &self,
        id: &InstanceId,
        seq: u64,
        update: StateUpdate,
        now: Instant,
    ) -> Result<UpdateOutcome> {
        {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            if seq != 0 && seq <= entry.last_seq {
                debug!("Dropping stale state update from {} (seq {} <= {})", id, seq, entry.last_seq);
                return Ok(UpdateOutcome::Stale);
            }
            if update.capacity == 0 {
                return Err(ControllerError::Validation(format!(
                    "instance {id} reported capacity 0"
                )));
            }
            if update.occupancy > update.capacity {
                return Err(ControllerError::Validation(format!(
                    "instance {id} reported occupancy {} above capacity {}",
                    update.occupancy, update.capacity
                )));
            }
            // Players the controller placed still count against the new capacity.
            if update.capacity < entry.assigned {
                warn!(
                    "Instance {} tried to shrink capacity to {} below {} assigned player(s)",
                    id, update.capacity, entry.assigned
                );
                return Err(ControllerError::Validation(format!(
                    "instance {id} reported capacity {} below {} assigned player(s)",
                    update.capacity, entry.assigned
                )));
            }
            if seq != 0 {
                entry.last_seq = seq;
            }
            entry.reported = update.occupancy;
            entry.capacity = update.capacity;
            entry.last_heartbeat = now;
            if update.closing && entry.lifecycle != Lifecycle::Closing {
                entry.lifecycle = Lifecycle::Closing;
                info!("🌙 Instance {} is closing, draining {} player(s)", id, entry.occupancy());
            }
            entry.refresh_lifecycle();
            debug!(
                "Instance {} now {}/{} ({})",
                id,
                entry.occupancy(),
                entry.capacity,
                entry.lifecycle.as_str()
            );
        }

        self.notify_changed(id);
        Ok(UpdateOutcome::Applied)
    }

    /// Stops new routing to an instance while its sessions drain.
    pub fn begin_close(&self, id: &InstanceId) -> Result<()> {
        {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            entry.lifecycle = Lifecycle::Closing;
        }
        info!("🌙 Instance {} marked closing", id);
        self.notify_changed(id);
        Ok(())
    }

    pub fn deregister(&self, id: &InstanceId) -> Result<InstanceSnapshot> {
        let (_, entry) = self
            .instances
            .remove(id)
            .ok_or_else(|| ControllerError::instance_not_found(id))?;
        let snapshot = entry.snapshot();
        info!("👋 Instance {} deregistered", id);
        self.notify_evicted(&snapshot, EvictionReason::Deregistered);
        Ok(snapshot)
    }

    pub fn get(&self, id: &InstanceId) -> Option<InstanceSnapshot> {
        self.instances.get(id).map(|entry| entry.snapshot())
    }

    pub fn snapshot(&self, id: &InstanceId) -> Result<InstanceSnapshot> {
        self.get(id)
            .ok_or_else(|| ControllerError::instance_not_found(id))
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances matching `filter`, in registration order.
    pub fn query(&self, filter: &InstanceFilter) -> Vec<InstanceSnapshot> {
        let mut matches: Vec<InstanceSnapshot> = self
            .instances
            .iter()
            .map(|entry| entry.snapshot())
            .filter(|snapshot| filter.matches(snapshot))
            .collect();
        matches.sort_by_key(|snapshot| snapshot.registration_seq);
        matches
    }

    /// Holds `seats` slots for a routing request.
    ///
    /// Reserved slots count against capacity but are not players yet; they
    /// turn into assigned players with [`commit`](Self::commit) or go back to
    /// the pool with [`release`](Self::release). The capacity check and the
    /// increment happen under the same entry lock.
    ///
    /// # Arguments
    ///
    /// * `id` - The instance to reserve on
    /// * `seats` - Number of slots, one per player of the request
    ///
    /// # Errors
    ///
    /// * [`ControllerError::NotFound`] - no such instance
    /// * [`ControllerError::NotJoinable`] - the instance is registering,
    ///   closing or otherwise not accepting players
    /// * [`ControllerError::CapacityExceeded`] - occupancy plus existing
    ///   reservations leave fewer than `seats` free slots
    pub fn reserve(&self, id: &InstanceId, seats: u32) -> Result<()> {
        {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            entry.ensure_room(seats)?;
            entry.reserved += seats;
            entry.refresh_lifecycle();
        }
        self.notify_changed(id);
        Ok(())
    }

    /// Returns reserved slots to the pool.
    ///
    /// Called when a routing request is declined, times out or is cancelled
    /// after it was matched. A `Full` instance whose reservations drop below
    /// capacity becomes `Available` again.
    ///
    /// # Errors
    ///
    /// * [`ControllerError::NotFound`] - no such instance
    /// * [`ControllerError::InvariantViolation`] - more than the current
    ///   reservation was released. This is an accounting bug; the
    ///   reservation is still clamped to zero so the instance stays usable.
    pub fn release(&self, id: &InstanceId, seats: u32) -> Result<()> {
        let result = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            let result = if seats > entry.reserved {
                error!(
                    "💥 Instance {} asked to release {} slot(s) but only {} reserved",
                    id, seats, entry.reserved
                );
                Err(ControllerError::InvariantViolation(format!(
                    "release of {seats} slot(s) on {id} exceeds reservation of {}",
                    entry.reserved
                )))
            } else {
                Ok(())
            };
            entry.reserved = entry.reserved.saturating_sub(seats);
            entry.refresh_lifecycle();
            result
        };
        self.notify_changed(id);
        result
    }

    /// Converts `seats` reserved slots into assigned players.
    ///
    /// # Errors
    ///
    /// * [`ControllerError::CapacityExceeded`] - the instance filled up from
    ///   another source (a larger reported occupancy) since the reservation
    ///   was taken. The reservation is released either way.
    /// * [`ControllerError::InvariantViolation`] - `seats` exceeds what is
    ///   reserved; nothing changes.
    pub fn commit(&self, id: &InstanceId, seats: u32) -> Result<()> {
        let result = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            if seats > entry.reserved {
                return Err(ControllerError::InvariantViolation(format!(
                    "commit of {seats} slot(s) on {id} exceeds reservation of {}",
                    entry.reserved
                )));
            }
            entry.reserved -= seats;
            let assigned = entry.assigned.saturating_add(seats);
            if assigned.max(entry.reported) > entry.capacity {
                entry.refresh_lifecycle();
                Err(ControllerError::CapacityExceeded {
                    instance: id.clone(),
                })
            } else {
                entry.assigned = assigned;
                entry.refresh_lifecycle();
                Ok(())
            }
        };
        self.notify_changed(id);
        result
    }

    /// Places one player directly, re-checking capacity under the entry lock.
    ///
    /// Of any number of concurrent calls racing for the last slot, exactly one
    /// succeeds.
    pub fn occupy(&self, id: &InstanceId) -> Result<()> {
        {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            entry.ensure_room(1)?;
            entry.assigned += 1;
            entry.refresh_lifecycle();
        }
        self.notify_changed(id);
        Ok(())
    }

    /// Frees one assigned slot.
    ///
    /// Vacating an instance with no assigned players would drive occupancy
    /// negative; the instance is quarantined and `InvariantViolation` returned.
    pub fn vacate(&self, id: &InstanceId) -> Result<()> {
        let quarantined = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| ControllerError::instance_not_found(id))?;
            if entry.assigned == 0 {
                true
            } else {
                entry.assigned -= 1;
                entry.refresh_lifecycle();
                false
            }
        };

        if quarantined {
            error!("💥 Occupancy of instance {} would go negative, quarantining", id);
            if let Some((_, entry)) = self.instances.remove(id) {
                self.notify_evicted(&entry.snapshot(), EvictionReason::Quarantined);
            }
            return Err(ControllerError::InvariantViolation(format!(
                "occupancy of {id} would go negative"
            )));
        }

        self.notify_changed(id);
        Ok(())
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Evicts instances whose heartbeat is older than the timeout and removes
    /// drained `Closing` instances.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut expired = Vec::new();
        let mut closed = Vec::new();

        self.instances.retain(|_, entry| {
            if entry.is_expired(now, self.heartbeat_timeout) {
                expired.push(entry.snapshot());
                false
            } else if entry.lifecycle == Lifecycle::Closing && entry.is_drained() {
                let mut snapshot = entry.snapshot();
                snapshot.lifecycle = Lifecycle::Closed;
                closed.push(snapshot);
                false
            } else {
                true
            }
        });

        for snapshot in &expired {
            warn!(
                "💀 Instance {} missed heartbeats for over {:?}, evicting",
                snapshot.id, self.heartbeat_timeout
            );
            self.notify_evicted(snapshot, EvictionReason::HeartbeatTimeout);
        }
        for snapshot in &closed {
            info!("🏁 Instance {} drained and closed", snapshot.id);
            self.notify_evicted(snapshot, EvictionReason::Closed);
        }

        SweepReport {
            expired: expired.into_iter().map(|s| s.id).collect(),
            closed: closed.into_iter().map(|s| s.id).collect(),
        }
    }
}

fn validate_descriptor(descriptor: &InstanceDescriptor) -> Result<()> {
    if descriptor.game_type.trim().is_empty() {
        return Err(ControllerError::Validation("game type is required".into()));
    }
    if descriptor.capacity == 0 {
        return Err(ControllerError::Validation("capacity must be greater than 0".into()));
    }
    if descriptor.address.trim().is_empty() {
        return Err(ControllerError::Validation("address is required".into()));
    }
    if descriptor.id.as_ref().is_some_and(|id| id.as_str().trim().is_empty()) {
        return Err(ControllerError::Validation("declared id must not be empty".into()));
    }
    Ok(())
}
