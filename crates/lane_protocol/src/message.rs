//! Message kinds exchanged between the controller and instances.

use crate::types::{HealthStatus, InstanceDescriptor, InstanceId, PlayerId, RequestId};
use serde::{Deserialize, Serialize};

/// A single protocol message.
///
/// Encoded as a JSON object tagged by `kind`. Kinds this build doesn't know
/// about decode to [`Message::Unknown`] so that a newer peer can add message
/// kinds without breaking older ones mid-upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // instance -> controller
    Register {
        descriptor: InstanceDescriptor,
    },
    Heartbeat {
        #[serde(default)]
        status: HealthStatus,
    },
    StateUpdate {
        occupancy: u32,
        capacity: u32,
        #[serde(default)]
        closing: bool,
    },
    RouteAck {
        request_id: RequestId,
    },
    RouteNack {
        request_id: RequestId,
        #[serde(default)]
        reason: String,
    },
    Deregister,

    // controller -> instance
    Registered {
        instance_id: InstanceId,
        heartbeat_interval_ms: u64,
    },
    HeartbeatAck,
    RouteDirective {
        request_id: RequestId,
        players: Vec<PlayerId>,
    },
    Rejected {
        code: RejectCode,
        message: String,
    },

    #[serde(other)]
    Unknown,
}

impl Message {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "REGISTER",
            Message::Heartbeat { .. } => "HEARTBEAT",
            Message::StateUpdate { .. } => "STATE_UPDATE",
            Message::RouteAck { .. } => "ROUTE_ACK",
            Message::RouteNack { .. } => "ROUTE_NACK",
            Message::Deregister => "DEREGISTER",
            Message::Registered { .. } => "REGISTERED",
            Message::HeartbeatAck => "HEARTBEAT_ACK",
            Message::RouteDirective { .. } => "ROUTE_DIRECTIVE",
            Message::Rejected { .. } => "REJECTED",
            Message::Unknown => "UNKNOWN",
        }
    }
}

/// Why the controller refused a message or a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    Validation,
    DuplicateRegistration,
    NotRegistered,
    UnsupportedVersion,
    ProtocolViolation,
}
