use crate::error::{ControllerError, Result};
use crate::registry::InstanceSnapshot;
use lane_protocol::{InstanceId, PlayerId, RequestId};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Instant;

/// One set of acceptable instances: a game type plus metadata every
/// candidate must carry (map, mode, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteStage {
    pub game_type: String,
    pub metadata: BTreeMap<String, String>,
}

impl RouteStage {
    pub fn new(game_type: impl Into<String>) -> Self {
        Self {
            game_type: game_type.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Game type matches and every required metadata entry is present with
    /// the same value. Extra metadata on the instance is ignored.
    pub fn matches(&self, instance: &InstanceSnapshot) -> bool {
        instance.game_type == self.game_type
            && self
                .metadata
                .iter()
                .all(|(key, value)| instance.metadata.get(key) == Some(value))
    }
}

impl fmt::Display for RouteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.game_type)?;
        if !self.metadata.is_empty() {
            let pairs: Vec<String> = self.metadata.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "[{}]", pairs.join(","))?;
        }
        Ok(())
    }
}

/// What a routing request asks for.
///
/// Stages are tried in order: a later stage is only considered when no
/// instance matching an earlier one could take the request. A typical
/// request asks for a specific map and falls back to the lobby:
///
/// ```
/// use lane_controller::{RouteConstraints, RouteStage};
///
/// let constraints = RouteConstraints::game_type("skywars")
///     .with_metadata("map", "village")
///     .or_else(RouteStage::new("skywars"))
///     .or_else(RouteStage::new("lobby"));
/// assert_eq!(constraints.stages.len(), 3);
/// assert_eq!(constraints.primary_game_type(), "skywars");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConstraints {
    /// Acceptable instances, most wanted first
    pub stages: Vec<RouteStage>,
    /// Players travelling with the requester
    pub party: Vec<PlayerId>,
    /// Instance to try first; the only way to reach a private instance
    pub preferred_instance: Option<InstanceId>,
}

impl RouteConstraints {
    pub fn game_type(game_type: impl Into<String>) -> Self {
        Self::stage(RouteStage::new(game_type))
    }

    pub fn stage(stage: RouteStage) -> Self {
        Self {
            stages: vec![stage],
            party: Vec::new(),
            preferred_instance: None,
        }
    }

    /// Adds a metadata requirement to the most recently added stage.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.metadata.insert(key.into(), value.into());
        }
        self
    }

    /// Appends a fallback stage.
    pub fn or_else(mut self, stage: RouteStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_party(mut self, party: impl IntoIterator<Item = PlayerId>) -> Self {
        self.party = party.into_iter().collect();
        self
    }

    pub fn prefer(mut self, instance: impl Into<InstanceId>) -> Self {
        self.preferred_instance = Some(instance.into());
        self
    }

    pub fn primary_game_type(&self) -> &str {
        self.stages.first().map(|stage| stage.game_type.as_str()).unwrap_or("")
    }

    /// Index of the first stage `instance` satisfies.
    pub fn stage_of(&self, instance: &InstanceSnapshot) -> Option<usize> {
        self.stages.iter().position(|stage| stage.matches(instance))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(ControllerError::Validation("at least one route stage is required".into()));
        }
        if self.stages.iter().any(|stage| stage.game_type.trim().is_empty()) {
            return Err(ControllerError::Validation("game type is required".into()));
        }
        Ok(())
    }
}

/// Why a request was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// The player just joined the network.
    NetworkJoin,
    /// Explicitly requested through the adapter.
    Requested,
    /// The player's instance went away.
    Orphaned,
}

/// Why a request ended without a placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NoEligibleInstance,
    /// The last candidate declined (or could not be reached).
    Declined(String),
    Cancelled,
    /// The matched instance left the registry before confirming.
    InstanceLost,
    PlayerLeft,
}

/// State of a routing request.
///
/// `Pending → Matched → Confirmed`, `Pending → Rejected`,
/// `Matched → TimedOut`; a decline sends `Matched` back to `Pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteState {
    Pending,
    Matched { instance: InstanceId },
    Confirmed { instance: InstanceId },
    Rejected(RejectReason),
    TimedOut,
}

impl RouteState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RouteState::Confirmed { .. } | RouteState::Rejected(_) | RouteState::TimedOut
        )
    }

    fn name(&self) -> &'static str {
        match self {
            RouteState::Pending => "pending",
            RouteState::Matched { .. } => "matched",
            RouteState::Confirmed { .. } => "confirmed",
            RouteState::Rejected(_) => "rejected",
            RouteState::TimedOut => "timed out",
        }
    }

    fn can_become(&self, next: &RouteState) -> bool {
        matches!(
            (self, next),
            (RouteState::Pending, RouteState::Matched { .. })
                | (RouteState::Pending, RouteState::Rejected(_))
                | (RouteState::Matched { .. }, RouteState::Pending)
                | (RouteState::Matched { .. }, RouteState::Confirmed { .. })
                | (RouteState::Matched { .. }, RouteState::Rejected(_))
                | (RouteState::Matched { .. }, RouteState::TimedOut)
        )
    }
}

/// A routing request, owned by the routing engine.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    pub id: RequestId,
    pub requester: PlayerId,
    pub constraints: RouteConstraints,
    pub reason: RouteReason,
    pub state: RouteState,
    /// Instances that declined this request
    pub excluded: HashSet<InstanceId>,
    /// Matches attempted so far
    pub attempts: u32,
    /// Registration of the matched instance, to tell a re-registered id apart
    pub matched_registration: Option<u64>,
    pub created_at: Instant,
    pub matched_at: Option<Instant>,
}

impl RoutingRequest {
    pub fn new(requester: PlayerId, constraints: RouteConstraints, reason: RouteReason) -> Self {
        Self {
            id: RequestId::new(),
            requester,
            constraints,
            reason,
            state: RouteState::Pending,
            excluded: HashSet::new(),
            attempts: 0,
            matched_registration: None,
            created_at: Instant::now(),
            matched_at: None,
        }
    }

    /// Requester followed by the party, without duplicates.
    pub fn players(&self) -> Vec<PlayerId> {
        let mut players = vec![self.requester];
        for member in &self.constraints.party {
            if !players.contains(member) {
                players.push(*member);
            }
        }
        players
    }

    pub fn seats(&self) -> u32 {
        self.players().len() as u32
    }

    pub fn matched_instance(&self) -> Option<&InstanceId> {
        match &self.state {
            RouteState::Matched { instance } => Some(instance),
            _ => None,
        }
    }

    /// Moves to `next`, refusing transitions the state machine does not allow.
    pub fn transition(&mut self, next: RouteState) -> Result<()> {
        if !self.state.can_become(&next) {
            return Err(ControllerError::InvariantViolation(format!(
                "request {} cannot go from {} to {}",
                self.id,
                self.state.name(),
                next.name()
            )));
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn players_include_party_once() {
        let (a, b) = (PlayerId::new(), PlayerId::new());
        let request = RoutingRequest::new(
            a,
            RouteConstraints::game_type("arena").with_party([b, a, b]),
            RouteReason::Requested,
        );
        assert_eq!(request.players(), vec![a, b]);
        assert_eq!(request.seats(), 2);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut request = RoutingRequest::new(
            PlayerId::new(),
            RouteConstraints::game_type("arena"),
            RouteReason::Requested,
        );
        let instance = InstanceId::new("a");

        request
            .transition(RouteState::Matched {
                instance: instance.clone(),
            })
            .unwrap();
        request.transition(RouteState::TimedOut).unwrap();
        assert!(request.state.is_terminal());

        let err = request
            .transition(RouteState::Confirmed { instance })
            .unwrap_err();
        assert!(matches!(err, ControllerError::InvariantViolation(_)));
        assert_eq!(request.state, RouteState::TimedOut);
    }

    fn snapshot(game_type: &str, metadata: &[(&str, &str)]) -> InstanceSnapshot {
        let registry = crate::registry::InstanceRegistry::new(std::time::Duration::from_secs(10));
        let mut descriptor = lane_protocol::InstanceDescriptor::new(game_type, "10.0.0.1:1", 4);
        for (key, value) in metadata {
            descriptor = descriptor.with_metadata(*key, *value);
        }
        let id = registry.register(descriptor).unwrap();
        registry.snapshot(&id).unwrap()
    }

    #[test]
    fn stage_requires_every_metadata_entry() {
        let village = RouteStage::new("skywars").with_metadata("map", "village");
        assert!(village.matches(&snapshot("skywars", &[("map", "village"), ("mode", "solo")])));
        assert!(!village.matches(&snapshot("skywars", &[("map", "castle")])));
        assert!(!village.matches(&snapshot("skywars", &[])));
        assert!(!village.matches(&snapshot("bedwars", &[("map", "village")])));
        assert_eq!(village.to_string(), "skywars[map=village]");
    }

    #[test]
    fn stage_of_picks_the_first_matching_stage() {
        let constraints = RouteConstraints::game_type("skywars")
            .with_metadata("map", "village")
            .or_else(RouteStage::new("skywars"))
            .or_else(RouteStage::new("lobby"));

        assert_eq!(constraints.stage_of(&snapshot("skywars", &[("map", "village")])), Some(0));
        assert_eq!(constraints.stage_of(&snapshot("skywars", &[("map", "castle")])), Some(1));
        assert_eq!(constraints.stage_of(&snapshot("lobby", &[])), Some(2));
        assert_eq!(constraints.stage_of(&snapshot("bedwars", &[])), None);
    }

    #[test]
    fn constraints_without_a_usable_stage_are_invalid() {
        let mut empty = RouteConstraints::game_type("arena");
        empty.stages.clear();
        assert!(matches!(empty.validate(), Err(ControllerError::Validation(_))));

        let blank_fallback = RouteConstraints::game_type("arena").or_else(RouteStage::new(" "));
        assert!(blank_fallback.validate().is_err());
        assert!(RouteConstraints::game_type("arena").validate().is_ok());
    }

    #[test]
    fn pending_cannot_time_out_or_confirm() {
        let mut request = RoutingRequest::new(
            PlayerId::new(),
            RouteConstraints::game_type("arena"),
            RouteReason::Requested,
        );
        assert!(request.transition(RouteState::TimedOut).is_err());
        assert!(request
            .transition(RouteState::Confirmed {
                instance: InstanceId::new("a")
            })
            .is_err());
        assert_eq!(request.state, RouteState::Pending);
    }
}
