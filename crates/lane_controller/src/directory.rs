//! Player → instance directory.
//!
//! One `DashMap` entry per connected player. A player references at most one
//! instance; moving to a new instance secures the new slot first and only
//! then frees the old one, so a failed move leaves the player where they were.

use crate::cache::LookupCache;
use crate::error::{ControllerError, Result};
use crate::persistence::{SessionOutcome, SessionRecord, SessionWriter};
use crate::registry::{EvictionReason, InstanceRegistry, InstanceSnapshot, RegistryObserver};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lane_protocol::{InstanceId, PlayerId, RequestId};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where a player stands with respect to routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connected, not placed on any instance.
    Unassigned,
    /// A routing request for the player is in flight.
    Transferring,
    /// Placed on an instance.
    Online,
    /// Their instance went away; eligible for re-routing.
    Orphaned,
}

/// A connected player's session.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerSession {
    pub player: PlayerId,
    pub instance: Option<InstanceId>,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    pub pending_request: Option<RequestId>,
    /// State to fall back to when the pending request fails.
    #[serde(skip)]
    resume_state: SessionState,
}

impl PlayerSession {
    fn new(player: PlayerId) -> Self {
        Self {
            player,
            instance: None,
            started_at: Utc::now(),
            state: SessionState::Unassigned,
            pending_request: None,
            resume_state: SessionState::Unassigned,
        }
    }

    fn settled_state(&self) -> SessionState {
        match self.state {
            SessionState::Transferring => self.resume_state,
            state => state,
        }
    }

    fn to_record(&self, ended_at: DateTime<Utc>) -> SessionRecord {
        let outcome = match (self.settled_state(), &self.instance) {
            (_, Some(_)) => SessionOutcome::Completed,
            (SessionState::Orphaned, None) => SessionOutcome::Orphaned,
            _ => SessionOutcome::Unassigned,
        };
        SessionRecord::new(
            self.player,
            self.instance.clone(),
            self.started_at,
            ended_at,
            outcome,
        )
    }
}

/// The session directory.
pub struct SessionDirectory {
    sessions: DashMap<PlayerId, PlayerSession>,
    registry: Arc<InstanceRegistry>,
    writer: Arc<SessionWriter>,
    cache: Arc<LookupCache>,
}

impl SessionDirectory {
    pub fn new(registry: Arc<InstanceRegistry>, writer: Arc<SessionWriter>, cache: Arc<LookupCache>) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            writer,
            cache,
        }
    }

    /// Starts tracking `player`. Idempotent: a repeated connect returns the
    /// existing session unchanged.
    pub fn begin_session(&self, player: PlayerId) -> PlayerSession {
        let session = self
            .sessions
            .entry(player)
            .or_insert_with(|| {
                info!("👋 Player {} connected", player);
                PlayerSession::new(player)
            })
            .clone();
        self.cache.players.invalidate(&player);
        session
    }

    pub fn lookup(&self, player: &PlayerId) -> Result<PlayerSession> {
        self.sessions
            .get(player)
            .map(|session| session.clone())
            .ok_or_else(|| ControllerError::player_not_found(player))
    }

    pub fn contains(&self, player: &PlayerId) -> bool {
        self.sessions.contains_key(player)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Places `player` on `instance`, re-checking capacity atomically.
    ///
    /// Fails with `CapacityExceeded` rather than overcommitting. If the player
    /// was on another instance, that slot is freed once the new one is held.
    pub fn assign(&self, player: &PlayerId, instance: &InstanceId) -> Result<PlayerSession> {
        let (session, previous) = {
            let mut session = self
                .sessions
                .get_mut(player)
                .ok_or_else(|| ControllerError::player_not_found(player))?;
            if session.instance.as_ref() == Some(instance) {
                return Ok(session.clone());
            }
            self.registry.occupy(instance)?;
            let previous = session.instance.replace(instance.clone());
            if session.state == SessionState::Transferring {
                session.resume_state = SessionState::Online;
            } else {
                session.state = SessionState::Online;
            }
            (session.clone(), previous)
        };

        if let Some(previous) = previous {
            self.free_slot(&previous);
        }
        self.cache.players.invalidate(player);
        info!("➡️ Player {} assigned to {}", player, instance);
        Ok(session)
    }

    /// Turns the slots reserved for a confirmed routing request into
    /// assignments and places every player of the request on `instance`.
    pub fn assign_reserved(&self, players: &[PlayerId], instance: &InstanceId, request: RequestId) -> Result<()> {
        let seats = u32::try_from(players.len())
            .map_err(|_| ControllerError::Validation(format!("party of {} is too large", players.len())))?;
        self.registry.commit(instance, seats)?;
        for player in players {
            self.place_committed(player, instance, request);
        }
        Ok(())
    }

    /// Places a player whose slot was already committed by a confirmed
    /// routing request and clears that request.
    ///
    /// If the player disconnected meanwhile, the committed slot is freed.
    fn place_committed(&self, player: &PlayerId, instance: &InstanceId, request: RequestId) {
        let previous = match self.sessions.get_mut(player) {
            Some(mut session) => {
                let previous = session.instance.replace(instance.clone());
                session.state = SessionState::Online;
                session.resume_state = SessionState::Online;
                if session.pending_request == Some(request) {
                    session.pending_request = None;
                }
                previous.filter(|prev| prev != instance)
            }
            None => {
                warn!("Player {} left before confirmation, freeing slot on {}", player, instance);
                Some(instance.clone())
            }
        };

        if let Some(previous) = previous {
            self.free_slot(&previous);
        }
        self.cache.players.invalidate(player);
    }

    fn free_slot(&self, instance: &InstanceId) {
        match self.registry.vacate(instance) {
            Ok(()) | Err(ControllerError::NotFound { .. }) => {}
            Err(e) => error!("Failed to free slot on {}: {}", instance, e),
        }
    }

    /// Marks `player` as being routed by `request`.
    ///
    /// A player can have only one active routing request.
    pub(crate) fn claim_request(&self, player: &PlayerId, request: RequestId) -> Result<()> {
        {
            let mut session = self
                .sessions
                .get_mut(player)
                .ok_or_else(|| ControllerError::player_not_found(player))?;
            if let Some(active) = session.pending_request {
                return Err(ControllerError::Validation(format!(
                    "player {player} already has active routing request {active}"
                )));
            }
            session.pending_request = Some(request);
            session.resume_state = session.state;
            session.state = SessionState::Transferring;
        }
        self.cache.players.invalidate(player);
        Ok(())
    }

    /// Drops `request` from `player` after it failed, restoring their state.
    pub(crate) fn release_request(&self, player: &PlayerId, request: RequestId) {
        if let Some(mut session) = self.sessions.get_mut(player) {
            if session.pending_request == Some(request) {
                session.pending_request = None;
                session.state = session.settled_state();
            }
        }
        self.cache.players.invalidate(player);
    }

    /// Ends a session, frees its slot and durably records it.
    ///
    /// Teardown always completes; a store failure is returned afterwards and
    /// the record stays buffered in the writer.
    pub async fn end_session(&self, player: &PlayerId) -> Result<SessionRecord> {
        let (_, session) = self
            .sessions
            .remove(player)
            .ok_or_else(|| ControllerError::player_not_found(player))?;

        if let Some(instance) = &session.instance {
            self.free_slot(instance);
        }
        self.cache.players.invalidate(player);

        let record = session.to_record(Utc::now());
        info!(
            "👋 Player {} disconnected after {}ms ({})",
            player,
            record.duration_ms,
            record.outcome.as_str()
        );
        self.writer.write(record.clone()).await?;
        Ok(record)
    }

    /// Players currently placed on `instance`.
    pub fn players_on(&self, instance: &InstanceId) -> Vec<PlayerId> {
        self.sessions
            .iter()
            .filter(|session| session.instance.as_ref() == Some(instance))
            .map(|session| session.player)
            .collect()
    }

    /// Orphaned players with no routing request in flight.
    pub fn orphaned(&self) -> Vec<PlayerId> {
        self.sessions
            .iter()
            .filter(|session| session.state == SessionState::Orphaned && session.pending_request.is_none())
            .map(|session| session.player)
            .collect()
    }

    /// Detaches every player from `instance` and marks them orphaned.
    pub fn orphan_players_on(&self, instance: &InstanceId) -> Vec<PlayerId> {
        let mut orphaned = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if session.instance.as_ref() != Some(instance) {
                continue;
            }
            session.instance = None;
            if session.state == SessionState::Transferring {
                session.resume_state = SessionState::Orphaned;
            } else {
                session.state = SessionState::Orphaned;
            }
            orphaned.push(session.player);
        }

        for player in &orphaned {
            self.cache.players.invalidate(player);
        }
        if !orphaned.is_empty() {
            warn!("🧭 {} player(s) orphaned by loss of {}", orphaned.len(), instance);
        }
        orphaned
    }
}

impl RegistryObserver for SessionDirectory {
    fn on_instance_evicted(&self, instance: &InstanceSnapshot, reason: EvictionReason) {
        debug!("Directory handling eviction of {} ({:?})", instance.id, reason);
        self.orphan_players_on(&instance.id);
    }
}
