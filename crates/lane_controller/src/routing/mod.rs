//! Routing engine: picks an instance for a player (and party), reserves
//! slots, hands the instance a directive and waits for its answer.
//!
//! Requests live in a `DashMap` keyed by id. A request's entry lock is never
//! held while calling anything that can evict an instance, since eviction
//! observers (this engine included) take request locks themselves.

mod policy;
mod request;

pub use policy::{LeastLoaded, MostLoaded, SelectionPolicy};
pub use request::{
    RejectReason, RouteConstraints, RouteReason, RouteStage, RouteState, RoutingRequest,
};

use crate::adapter::PlatformAdapter;
use crate::config::ControllerConfig;
use crate::directory::SessionDirectory;
use crate::error::{ControllerError, Result};
use crate::registry::{
    EvictionReason, InstanceFilter, InstanceRegistry, InstanceSnapshot, Lifecycle, RegistryObserver,
};
use dashmap::DashMap;
use lane_protocol::{InstanceId, PlayerId, RequestId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Delivers ROUTE_DIRECTIVE frames to instances.
pub trait DirectiveSink: Send + Sync {
    /// Queues a directive without waiting. An error means it was not sent.
    fn send_directive(&self, instance: &InstanceId, request: RequestId, players: &[PlayerId]) -> Result<()>;
}

/// Caller's view of a submitted request.
pub struct RouteHandle {
    id: RequestId,
    state: watch::Receiver<RouteState>,
}

impl RouteHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Current state, possibly not yet terminal.
    pub fn state(&self) -> RouteState {
        self.state.borrow().clone()
    }

    /// Waits for the terminal state.
    pub async fn outcome(mut self) -> RouteState {
        loop {
            let current = self.state.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }
}

struct RequestSlot {
    request: RoutingRequest,
    state_tx: watch::Sender<RouteState>,
}

impl RequestSlot {
    fn advance(&mut self, next: RouteState) -> Result<()> {
        self.request.transition(next.clone())?;
        self.state_tx.send_replace(next);
        Ok(())
    }
}

enum Step {
    Send { instance: InstanceId, players: Vec<PlayerId> },
    Retry,
    Finish,
    Done,
}

/// The routing engine.
///
/// Holds every in-flight [`RoutingRequest`] and drives it through
/// `Pending → Matched → Confirmed`, or to `Rejected` / `TimedOut`. Matching
/// reserves slots on the chosen instance before the directive goes out, so
/// two requests can never be promised the same slot. Acknowledgement,
/// decline, cancellation and expiry all race through a single removal of the
/// request entry; whichever wins settles the request and the others see
/// `NotFound`.
///
/// The engine observes the registry: requests matched to an evicted
/// instance are rejected with [`RejectReason::InstanceLost`].
pub struct RoutingEngine {
    requests: DashMap<RequestId, RequestSlot>,
    registry: Arc<InstanceRegistry>,
    directory: Arc<SessionDirectory>,
    sink: Arc<dyn DirectiveSink>,
    adapter: Arc<dyn PlatformAdapter>,
    policy: Arc<dyn SelectionPolicy>,
    confirm_timeout: Duration,
    retry_limit: u32,
}

impl RoutingEngine {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        directory: Arc<SessionDirectory>,
        sink: Arc<dyn DirectiveSink>,
        adapter: Arc<dyn PlatformAdapter>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            requests: DashMap::new(),
            registry,
            directory,
            sink,
            adapter,
            policy: Arc::new(LeastLoaded),
            confirm_timeout: config.route_confirm_timeout,
            retry_limit: config.route_retry_limit,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Requests still in flight.
    pub fn active_count(&self) -> usize {
        self.requests.len()
    }

    pub fn get(&self, id: &RequestId) -> Option<RoutingRequest> {
        self.requests.get(id).map(|slot| slot.request.clone())
    }

    /// Creates a routing request and immediately tries to match it.
    ///
    /// # Arguments
    ///
    /// * `requester` - The player asking; with a party in `constraints` the
    ///   requester is routed together with it
    /// * `constraints` - Ordered stages tried first to last
    /// * `reason` - Why the request was made, kept for logging
    ///
    /// # Errors
    ///
    /// Every player in the request must have a session and no other active
    /// request; otherwise [`ControllerError::NotFound`] or
    /// [`ControllerError::Validation`] is returned and nothing is changed.
    /// Failing to find an instance is not an error: the returned handle is
    /// already `Rejected(NoEligibleInstance)`.
    pub fn submit(&self, requester: PlayerId, constraints: RouteConstraints, reason: RouteReason) -> Result<RouteHandle> {
        constraints.validate()?;

        let request = RoutingRequest::new(requester, constraints, reason);
        let id = request.id;
        let players = request.players();
        for player in &players {
            self.directory.lookup(player)?;
        }

        let mut claimed = Vec::with_capacity(players.len());
        for player in &players {
            if let Err(e) = self.directory.claim_request(player, id) {
                for done in &claimed {
                    self.directory.release_request(done, id);
                }
                return Err(e);
            }
            claimed.push(*player);
        }

        debug!(
            "Routing request {} for {} ({} seat(s), {:?}) to {} ({} stage(s))",
            id,
            requester,
            players.len(),
            reason,
            request.constraints.primary_game_type(),
            request.constraints.stages.len()
        );

        let (state_tx, state_rx) = watch::channel(RouteState::Pending);
        self.requests.insert(id, RequestSlot { request, state_tx });
        self.dispatch(id);

        Ok(RouteHandle { id, state: state_rx })
    }

    /// Matches a `Pending` request to the best eligible instance, reserves
    /// its slots and sends the directive.
    fn dispatch(&self, id: RequestId) {
        let step = {
            let Some(mut slot) = self.requests.get_mut(&id) else {
                return;
            };
            if slot.request.state != RouteState::Pending {
                return;
            }
            match self.find_and_reserve(&slot.request) {
                Some(candidate) => {
                    slot.request.attempts += 1;
                    slot.request.matched_registration = Some(candidate.registration_seq);
                    slot.request.matched_at = Some(Instant::now());
                    let matched = slot.advance(RouteState::Matched {
                        instance: candidate.id.clone(),
                    });
                    match matched {
                        Ok(()) => Step::Send {
                            instance: candidate.id,
                            players: slot.request.players(),
                        },
                        Err(e) => {
                            warn!("Request {}: {}", id, e);
                            Step::Done
                        }
                    }
                }
                None => {
                    warn!(
                        "🚫 No eligible {} instance for request {}",
                        slot.request.constraints.primary_game_type(),
                        id
                    );
                    match slot.advance(RouteState::Rejected(RejectReason::NoEligibleInstance)) {
                        Ok(()) => Step::Finish,
                        Err(_) => Step::Done,
                    }
                }
            }
        };

        match step {
            Step::Send { instance, players } => {
                debug!("Request {} matched to {}", id, instance);
                if let Err(e) = self.sink.send_directive(&instance, id, &players) {
                    warn!("Directive for request {} not delivered to {}: {}", id, instance, e);
                    if let Err(e) = self.decline(&instance, id, &format!("directive not delivered: {e}")) {
                        debug!("Request {} settled before delivery failure was handled: {}", id, e);
                    }
                }
            }
            Step::Finish => self.finish(id),
            Step::Retry | Step::Done => {}
        }
    }

    /// Walks the request's stages in order. Within a stage candidates are in
    /// policy order; the preferred instance, when eligible for any stage, is
    /// tried before everything else. Returns the first candidate whose slots
    /// could be reserved.
    fn find_and_reserve(&self, request: &RoutingRequest) -> Option<InstanceSnapshot> {
        let seats = request.seats();
        let constraints = &request.constraints;
        let eligible = |snapshot: &InstanceSnapshot| {
            snapshot.is_routable()
                && snapshot.free_slots() >= seats
                && !request.excluded.contains(&snapshot.id)
        };

        if let Some(preferred) = &constraints.preferred_instance {
            let snapshot = self
                .registry
                .get(preferred)
                .filter(|s| eligible(s) && constraints.stage_of(s).is_some());
            if let Some(snapshot) = snapshot {
                if self.try_reserve(&snapshot, request) {
                    return Some(snapshot);
                }
            }
        }

        for (index, stage) in constraints.stages.iter().enumerate() {
            let filter = InstanceFilter::game_type(stage.game_type.clone())
                .with_lifecycle(Lifecycle::Available)
                .with_free_slots(seats);
            let mut candidates: Vec<InstanceSnapshot> = self
                .registry
                .query(&filter)
                .into_iter()
                .filter(|snapshot| {
                    stage.matches(snapshot)
                        && eligible(snapshot)
                        && constraints.preferred_instance.as_ref() != Some(&snapshot.id)
                })
                .collect();
            self.policy.rank(&mut candidates);

            for candidate in candidates {
                if self.try_reserve(&candidate, request) {
                    if index > 0 {
                        debug!("Request {} fell back to stage {} ({})", request.id, index, stage);
                    }
                    return Some(candidate);
                }
            }
        }
        None
    }

    fn try_reserve(&self, candidate: &InstanceSnapshot, request: &RoutingRequest) -> bool {
        match self.registry.reserve(&candidate.id, request.seats()) {
            Ok(()) => true,
            Err(e) => {
                debug!("Skipping {} for request {}: {}", candidate.id, request.id, e);
                false
            }
        }
    }

    /// Handles ROUTE_ACK: commits the reserved slots, places the players and
    /// asks the platform to move them.
    pub async fn acknowledge(&self, instance: &InstanceId, id: RequestId) -> Result<()> {
        let (_, mut slot) = self
            .requests
            .remove_if(&id, |_, slot| slot.request.matched_instance() == Some(instance))
            .ok_or_else(|| self.unmatched(instance, id))?;

        let players = slot.request.players();
        if let Err(e) = self.directory.assign_reserved(&players, instance, id) {
            warn!("Request {} could not be confirmed on {}: {}", id, instance, e);
            slot.request.excluded.insert(instance.clone());
            let next = match &e {
                ControllerError::CapacityExceeded { .. } if slot.request.attempts <= self.retry_limit => {
                    RouteState::Pending
                }
                ControllerError::NotFound { .. } => RouteState::Rejected(RejectReason::InstanceLost),
                other => RouteState::Rejected(RejectReason::Declined(other.to_string())),
            };
            let retry = next == RouteState::Pending;
            slot.advance(next)?;
            if retry {
                self.requests.insert(id, slot);
                self.dispatch(id);
            } else {
                self.settle(slot);
            }
            return Err(e);
        }

        let address = match self.registry.get(instance) {
            Some(snapshot) => snapshot.address,
            None => {
                // Evicted between commit and placement.
                self.directory.orphan_players_on(instance);
                warn!("💔 Instance {} left before request {} could be confirmed", instance, id);
                slot.advance(RouteState::Rejected(RejectReason::InstanceLost))?;
                self.settle(slot);
                return Err(ControllerError::instance_not_found(instance));
            }
        };
        for player in &players {
            if let Err(e) = self.adapter.send_move_command(*player, &address).await {
                warn!("Move command for {} to {} failed: {}", player, address, e);
            }
        }

        slot.advance(RouteState::Confirmed {
            instance: instance.clone(),
        })?;
        info!(
            "✅ Request {} confirmed: {} player(s) routed to {}",
            id,
            players.len(),
            instance
        );
        self.settle(slot);
        Ok(())
    }

    fn unmatched(&self, instance: &InstanceId, id: RequestId) -> ControllerError {
        if self.requests.contains_key(&id) {
            ControllerError::Validation(format!("request {id} is not matched to {instance}"))
        } else {
            ControllerError::request_not_found(&id)
        }
    }

    /// Handles ROUTE_NACK or a failed delivery: frees the slots, excludes the
    /// instance and retries while the retry budget lasts.
    pub fn decline(&self, instance: &InstanceId, id: RequestId, reason: &str) -> Result<()> {
        let step = {
            let mut slot = self
                .requests
                .get_mut(&id)
                .ok_or_else(|| ControllerError::request_not_found(&id))?;
            if slot.request.matched_instance() != Some(instance) {
                return Err(ControllerError::Validation(format!(
                    "request {id} is not matched to {instance}"
                )));
            }

            self.release_slots(instance, slot.request.seats());
            slot.request.excluded.insert(instance.clone());
            if slot.request.attempts <= self.retry_limit {
                info!("↩️ {} declined request {} ({}), retrying", instance, id, reason);
                slot.advance(RouteState::Pending)?;
                Step::Retry
            } else {
                warn!("🚫 {} declined request {} ({}), giving up", instance, id, reason);
                slot.advance(RouteState::Rejected(RejectReason::Declined(reason.to_string())))?;
                Step::Finish
            }
        };

        match step {
            Step::Retry => self.dispatch(id),
            Step::Finish => self.finish(id),
            Step::Send { .. } | Step::Done => {}
        }
        Ok(())
    }

    pub fn cancel(&self, id: RequestId) -> Result<()> {
        self.cancel_with(id, RejectReason::Cancelled)
    }

    /// Cancels the request `player` belongs to, if any.
    pub fn cancel_for_player(&self, player: &PlayerId) -> Result<bool> {
        let Some(id) = self.directory.lookup(player)?.pending_request else {
            return Ok(false);
        };
        match self.cancel_with(id, RejectReason::PlayerLeft) {
            Ok(()) => Ok(true),
            Err(ControllerError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// A `Pending` request is rejected with `reason`; a `Matched` one times
    /// out and frees its slots. Settled requests are left alone.
    fn cancel_with(&self, id: RequestId, reason: RejectReason) -> Result<()> {
        {
            let mut slot = self
                .requests
                .get_mut(&id)
                .ok_or_else(|| ControllerError::request_not_found(&id))?;
            match slot.request.state.clone() {
                RouteState::Pending => slot.advance(RouteState::Rejected(reason))?,
                RouteState::Matched { instance } => {
                    self.release_slots(&instance, slot.request.seats());
                    slot.advance(RouteState::TimedOut)?;
                }
                _ => return Ok(()),
            }
        }
        info!("🛑 Request {} cancelled", id);
        self.finish(id);
        Ok(())
    }

    /// Times out `Matched` requests older than the confirmation timeout.
    pub fn expire_at(&self, now: Instant) -> Vec<RequestId> {
        let overdue: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|slot| self.is_overdue(&slot.request, now))
            .map(|slot| slot.request.id)
            .collect();

        let mut expired = Vec::new();
        for id in overdue {
            {
                let Some(mut slot) = self.requests.get_mut(&id) else {
                    continue;
                };
                if !self.is_overdue(&slot.request, now) {
                    continue;
                }
                if let Some(instance) = slot.request.matched_instance().cloned() {
                    self.release_slots(&instance, slot.request.seats());
                    warn!("⏰ Request {} not confirmed by {} in time", id, instance);
                }
                if slot.advance(RouteState::TimedOut).is_err() {
                    continue;
                }
            }
            self.finish(id);
            expired.push(id);
        }
        expired
    }

    fn is_overdue(&self, request: &RoutingRequest, now: Instant) -> bool {
        request.matched_instance().is_some()
            && request
                .matched_at
                .is_some_and(|at| now.saturating_duration_since(at) >= self.confirm_timeout)
    }

    fn release_slots(&self, instance: &InstanceId, seats: u32) {
        match self.registry.release(instance, seats) {
            Ok(()) | Err(ControllerError::NotFound { .. }) => {}
            Err(e) => warn!("Releasing {} slot(s) on {}: {}", seats, instance, e),
        }
    }

    /// Removes a settled request and clears it from its players.
    fn finish(&self, id: RequestId) {
        if let Some((_, slot)) = self.requests.remove(&id) {
            self.settle(slot);
        }
    }

    fn settle(&self, slot: RequestSlot) {
        for player in slot.request.players() {
            self.directory.release_request(&player, slot.request.id);
        }
        debug!("Request {} settled as {:?}", slot.request.id, slot.request.state);
    }
}

impl RegistryObserver for RoutingEngine {
    fn on_instance_evicted(&self, instance: &InstanceSnapshot, reason: EvictionReason) {
        let targeting = |request: &RoutingRequest| {
            request.matched_instance() == Some(&instance.id)
                && request.matched_registration == Some(instance.registration_seq)
        };
        let lost: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|slot| targeting(&slot.request))
            .map(|slot| slot.request.id)
            .collect();

        for id in lost {
            {
                let Some(mut slot) = self.requests.get_mut(&id) else {
                    continue;
                };
                if !targeting(&slot.request) {
                    continue;
                }
                if slot
                    .advance(RouteState::Rejected(RejectReason::InstanceLost))
                    .is_err()
                {
                    continue;
                }
            }
            warn!("💔 Request {} lost its instance {} ({:?})", id, instance.id, reason);
            self.finish(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LookupCache;
    use crate::config::CacheConfig;
    use crate::directory::SessionState;
    use crate::persistence::{MemorySessionStore, RetryPolicy, SessionWriter};
    use async_trait::async_trait;
    use lane_protocol::InstanceDescriptor;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(InstanceId, RequestId, Vec<PlayerId>)>>,
        broken: AtomicBool,
    }

    impl RecordingSink {
        fn last(&self) -> (InstanceId, RequestId, Vec<PlayerId>) {
            self.sent.lock().last().cloned().unwrap()
        }
    }

    impl DirectiveSink for RecordingSink {
        fn send_directive(&self, instance: &InstanceId, request: RequestId, players: &[PlayerId]) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ControllerError::Network(format!("no link to {instance}")));
            }
            self.sent.lock().push((instance.clone(), request, players.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingAdapter {
        moves: Mutex<Vec<(PlayerId, String)>>,
    }

    #[async_trait]
    impl PlatformAdapter for RecordingAdapter {
        async fn send_move_command(&self, player: PlayerId, address: &str) -> Result<()> {
            self.moves.lock().push((player, address.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        registry: Arc<InstanceRegistry>,
        directory: Arc<SessionDirectory>,
        engine: Arc<RoutingEngine>,
        sink: Arc<RecordingSink>,
        adapter: Arc<RecordingAdapter>,
    }

    fn fixture() -> Fixture {
        let config = ControllerConfig::default();
        let registry = Arc::new(InstanceRegistry::new(config.heartbeat_timeout));
        let writer = Arc::new(SessionWriter::new(
            Arc::new(MemorySessionStore::new()),
            RetryPolicy::immediate(0),
        ));
        let cache = Arc::new(LookupCache::new(&CacheConfig::default()));
        let directory = Arc::new(SessionDirectory::new(registry.clone(), writer, cache));
        let sink = Arc::new(RecordingSink::default());
        let adapter = Arc::new(RecordingAdapter::default());
        let engine = Arc::new(RoutingEngine::new(
            registry.clone(),
            directory.clone(),
            sink.clone(),
            adapter.clone(),
            &config,
        ));
        registry.subscribe(&directory);
        registry.subscribe(&engine);
        Fixture {
            registry,
            directory,
            engine,
            sink,
            adapter,
        }
    }

    impl Fixture {
        fn instance(&self, id: &str, game_type: &str, capacity: u32) -> InstanceId {
            let id = self
                .registry
                .register(InstanceDescriptor::new(game_type, format!("10.0.0.1:{capacity}"), capacity).with_id(id))
                .unwrap();
            self.registry.activate(&id).unwrap();
            id
        }

        fn player(&self) -> PlayerId {
            let player = PlayerId::new();
            self.directory.begin_session(player);
            player
        }

        fn route(&self, player: PlayerId, game_type: &str) -> RouteHandle {
            self.engine
                .submit(player, RouteConstraints::game_type(game_type), RouteReason::Requested)
                .unwrap()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acknowledged_request_is_confirmed_and_player_moved() {
        let f = fixture();
        let arena = f.instance("arena-1", "arena", 4);
        let player = f.player();

        let handle = f.route(player, "arena");
        assert_eq!(handle.state(), RouteState::Matched { instance: arena.clone() });
        assert_eq!(f.directory.lookup(&player).unwrap().state, SessionState::Transferring);
        assert_eq!(f.registry.snapshot(&arena).unwrap().reserved, 1);

        f.engine.acknowledge(&arena, handle.id()).await.unwrap();

        assert_eq!(handle.outcome().await, RouteState::Confirmed { instance: arena.clone() });
        let snapshot = f.registry.snapshot(&arena).unwrap();
        assert_eq!((snapshot.occupancy, snapshot.reserved), (1, 0));
        let session = f.directory.lookup(&player).unwrap();
        assert_eq!(session.instance, Some(arena));
        assert_eq!(session.state, SessionState::Online);
        assert!(session.pending_request.is_none());
        assert_eq!(f.adapter.moves.lock().len(), 1);
        assert_eq!(f.engine.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn least_loaded_instance_is_chosen() {
        let f = fixture();
        let busy = f.instance("busy", "arena", 4);
        let quiet = f.instance("quiet", "arena", 4);
        let seated = f.player();
        f.directory.assign(&seated, &busy).unwrap();

        let handle = f.route(f.player(), "arena");
        assert_eq!(handle.state(), RouteState::Matched { instance: quiet });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn private_instance_only_reached_when_preferred() {
        let f = fixture();
        let secret = f
            .registry
            .register(InstanceDescriptor::new("arena", "10.0.0.9:1", 4).with_id("secret").private())
            .unwrap();
        f.registry.activate(&secret).unwrap();

        let scan = f.route(f.player(), "arena");
        assert_eq!(scan.outcome().await, RouteState::Rejected(RejectReason::NoEligibleInstance));

        let preferred = f
            .engine
            .submit(
                f.player(),
                RouteConstraints::game_type("arena").prefer(secret.clone()),
                RouteReason::Requested,
            )
            .unwrap();
        assert_eq!(preferred.state(), RouteState::Matched { instance: secret });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn decline_retries_once_then_rejects() {
        let f = fixture();
        let first = f.instance("a", "arena", 4);
        let second = f.instance("b", "arena", 4);
        let third = f.instance("c", "arena", 4);
        let player = f.player();

        let handle = f.route(player, "arena");
        assert_eq!(handle.state(), RouteState::Matched { instance: first.clone() });

        f.engine.decline(&first, handle.id(), "full of bots").unwrap();
        assert_eq!(handle.state(), RouteState::Matched { instance: second.clone() });
        assert_eq!(f.registry.snapshot(&first).unwrap().reserved, 0);

        f.engine.decline(&second, handle.id(), "shutting down").unwrap();
        assert_eq!(
            handle.outcome().await,
            RouteState::Rejected(RejectReason::Declined("shutting down".into()))
        );
        assert_eq!(f.registry.snapshot(&second).unwrap().reserved, 0);
        assert_eq!(f.registry.snapshot(&third).unwrap().reserved, 0);
        assert_eq!(f.directory.lookup(&player).unwrap().state, SessionState::Unassigned);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn undeliverable_directive_counts_as_decline() {
        let f = fixture();
        let a = f.instance("a", "arena", 4);
        let b = f.instance("b", "arena", 4);
        f.sink.broken.store(true, Ordering::SeqCst);

        let handle = f.route(f.player(), "arena");
        assert!(matches!(
            handle.outcome().await,
            RouteState::Rejected(RejectReason::Declined(_))
        ));
        assert_eq!(f.registry.snapshot(&a).unwrap().reserved, 0);
        assert_eq!(f.registry.snapshot(&b).unwrap().reserved, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn party_reserves_seats_for_everyone() {
        let f = fixture();
        let small = f.instance("small", "arena", 2);
        let big = f.instance("big", "arena", 8);
        let (leader, a, b) = (f.player(), f.player(), f.player());

        let handle = f
            .engine
            .submit(
                leader,
                RouteConstraints::game_type("arena").with_party([a, b]),
                RouteReason::Requested,
            )
            .unwrap();
        assert_eq!(handle.state(), RouteState::Matched { instance: big.clone() });
        assert_eq!(f.sink.last().2, vec![leader, a, b]);
        assert_eq!(f.registry.snapshot(&small).unwrap().reserved, 0);

        f.engine.acknowledge(&big, handle.id()).await.unwrap();
        assert_eq!(f.directory.players_on(&big).len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_request_for_same_player_is_rejected() {
        let f = fixture();
        f.instance("a", "arena", 4);
        let player = f.player();
        let _first = f.route(player, "arena");

        let err = f
            .engine
            .submit(player, RouteConstraints::game_type("arena"), RouteReason::Requested)
            .err()
            .unwrap();
        assert!(matches!(err, ControllerError::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_matched_request_times_out_and_frees_slots() {
        let f = fixture();
        let arena = f.instance("a", "arena", 4);
        let handle = f.route(f.player(), "arena");

        f.engine.cancel(handle.id()).unwrap();
        assert_eq!(handle.outcome().await, RouteState::TimedOut);
        assert_eq!(f.registry.snapshot(&arena).unwrap().reserved, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn late_ack_after_expiry_is_refused() {
        let f = fixture();
        let arena = f.instance("a", "arena", 4);
        let handle = f.route(f.player(), "arena");
        let id = handle.id();

        let later = Instant::now() + ControllerConfig::default().route_confirm_timeout;
        assert_eq!(f.engine.expire_at(later), vec![id]);
        assert_eq!(handle.outcome().await, RouteState::TimedOut);

        let err = f.engine.acknowledge(&arena, id).await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound { .. }));
        assert_eq!(f.registry.snapshot(&arena).unwrap().occupancy, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ack_from_wrong_instance_is_refused() {
        let f = fixture();
        f.instance("a", "arena", 4);
        let handle = f.route(f.player(), "arena");

        let err = f
            .engine
            .acknowledge(&InstanceId::new("impostor"), handle.id())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
        assert!(!handle.state().is_terminal());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn losing_matched_instance_rejects_request() {
        let f = fixture();
        let arena = f.instance("a", "arena", 4);
        let player = f.player();
        let handle = f.route(player, "arena");

        f.registry.deregister(&arena).unwrap();

        assert_eq!(handle.outcome().await, RouteState::Rejected(RejectReason::InstanceLost));
        assert!(f.directory.lookup(&player).unwrap().pending_request.is_none());
    }

    /// Deregisters an instance as soon as the registry reports a change to it,
    /// once armed.
    struct EvictOnChange {
        registry: std::sync::Weak<InstanceRegistry>,
        target: InstanceId,
        armed: AtomicBool,
    }

    impl RegistryObserver for EvictOnChange {
        fn on_instance_changed(&self, instance: &InstanceId) {
            if instance == &self.target && self.armed.swap(false, Ordering::SeqCst) {
                if let Some(registry) = self.registry.upgrade() {
                    registry.deregister(instance).ok();
                }
            }
        }

        fn on_instance_evicted(&self, _instance: &InstanceSnapshot, _reason: EvictionReason) {}
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn instance_lost_during_ack_is_not_confirmed() {
        let f = fixture();
        let arena = f.instance("a", "arena", 4);
        let player = f.player();
        let handle = f.route(player, "arena");

        let evictor = Arc::new(EvictOnChange {
            registry: Arc::downgrade(&f.registry),
            target: arena.clone(),
            armed: AtomicBool::new(true),
        });
        f.registry.subscribe(&evictor);

        let err = f.engine.acknowledge(&arena, handle.id()).await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound { .. }));
        assert_eq!(handle.outcome().await, RouteState::Rejected(RejectReason::InstanceLost));

        let session = f.directory.lookup(&player).unwrap();
        assert_eq!(session.state, SessionState::Orphaned);
        assert!(session.instance.is_none());
        assert!(session.pending_request.is_none());
        assert!(f.adapter.moves.lock().is_empty());
        assert_eq!(f.engine.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_stage_is_preferred_over_plain_fallback() {
        let f = fixture();
        let plain = f.instance("plain", "skywars", 8);
        let village = f
            .registry
            .register(
                InstanceDescriptor::new("skywars", "10.0.0.5:1", 8)
                    .with_id("village")
                    .with_metadata("map", "village"),
            )
            .unwrap();
        f.registry.activate(&village).unwrap();
        // The plain instance is emptier, so only the stage order can pick the village.
        for _ in 0..4 {
            f.directory.assign(&f.player(), &village).unwrap();
        }

        let constraints = RouteConstraints::game_type("skywars")
            .with_metadata("map", "village")
            .or_else(RouteStage::new("skywars"));
        let handle = f
            .engine
            .submit(f.player(), constraints, RouteReason::Requested)
            .unwrap();
        assert_eq!(handle.state(), RouteState::Matched { instance: village.clone() });

        let only_castle = RouteConstraints::game_type("skywars").with_metadata("map", "castle");
        let missing = f
            .engine
            .submit(f.player(), only_castle, RouteReason::Requested)
            .unwrap();
        assert_eq!(
            missing.outcome().await,
            RouteState::Rejected(RejectReason::NoEligibleInstance)
        );
        assert_eq!(f.registry.snapshot(&plain).unwrap().reserved, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_first_stage_falls_back_to_lobby() {
        let f = fixture();
        let arena = f.instance("arena", "arena", 1);
        let lobby = f.instance("lobby", "lobby", 50);
        f.directory.assign(&f.player(), &arena).unwrap();

        let handle = f
            .engine
            .submit(
                f.player(),
                RouteConstraints::game_type("arena").or_else(RouteStage::new("lobby")),
                RouteReason::Requested,
            )
            .unwrap();
        assert_eq!(handle.state(), RouteState::Matched { instance: lobby.clone() });

        // A decline on the fallback is retried across every stage.
        f.engine.decline(&lobby, handle.id(), "restarting").unwrap();
        assert_eq!(
            handle.outcome().await,
            RouteState::Rejected(RejectReason::NoEligibleInstance)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn player_leaving_cancels_their_request() {
        let f = fixture();
        let arena = f.instance("a", "arena", 4);
        let player = f.player();
        let handle = f.route(player, "arena");

        assert!(f.engine.cancel_for_player(&player).unwrap());
        assert_eq!(handle.outcome().await, RouteState::TimedOut);
        assert_eq!(f.registry.snapshot(&arena).unwrap().reserved, 0);
        assert!(!f.engine.cancel_for_player(&player).unwrap());
    }
}
