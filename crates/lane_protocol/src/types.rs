//! Identifiers and descriptors shared by the controller and its instances.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifier of a registered game-server instance.
///
/// Instances may declare their own id on registration; when they don't, the
/// controller assigns a random one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Unique identifier for players
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a routing request, echoed back by instances in ACK/NACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Self-reported health of an instance, carried on every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Still accepting players but struggling (slow ticks, memory pressure).
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Whether the controller may route new players to an instance in this state.
    pub fn is_routable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

/// What an instance tells the controller about itself when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Declared id; `None` lets the controller pick one.
    #[serde(default)]
    pub id: Option<InstanceId>,
    /// Game type or category hosted by the instance (e.g. "arena", "lobby").
    pub game_type: String,
    /// Address players are moved to.
    pub address: String,
    /// Maximum number of players.
    pub capacity: u32,
    /// Private instances are only reachable when explicitly requested.
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InstanceDescriptor {
    pub fn new(game_type: impl Into<String>, address: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: None,
            game_type: game_type.into(),
            address: address.into(),
            capacity,
            private: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Current Unix time in milliseconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_optional_fields() {
        let json = r#"{"game_type":"arena","address":"10.0.0.5:25565","capacity":16}"#;
        let descriptor: InstanceDescriptor = serde_json::from_str(json).unwrap();

        assert!(descriptor.id.is_none());
        assert!(!descriptor.private);
        assert!(descriptor.metadata.is_empty());
        assert_eq!(descriptor.capacity, 16);
    }

    #[test]
    fn instance_id_serializes_as_plain_string() {
        let id = InstanceId::new("arena-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"arena-1\"");
    }

    #[test]
    fn unhealthy_instances_are_not_routable() {
        assert!(HealthStatus::Healthy.is_routable());
        assert!(HealthStatus::Degraded.is_routable());
        assert!(!HealthStatus::Unhealthy.is_routable());
    }
}
