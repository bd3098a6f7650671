//! # Lane Protocol
//!
//! Wire protocol spoken between the Lane controller and the game-server
//! instances it coordinates.
//!
//! ## Messages
//!
//! Instances send `REGISTER`, `HEARTBEAT`, `STATE_UPDATE`, `ROUTE_ACK`,
//! `ROUTE_NACK` and `DEREGISTER`. The controller answers with `REGISTERED`,
//! `HEARTBEAT_ACK` and `REJECTED`, and pushes `ROUTE_DIRECTIVE` when it wants
//! an instance to accept players.
//!
//! ## Framing
//!
//! Each message travels inside an [`Envelope`] carrying the protocol version
//! and a per-connection sequence number. Envelopes are JSON, framed with a
//! 4-byte big-endian length prefix.
//!
//! ## Versioning
//!
//! Peers accept any version in `MIN_SUPPORTED_VERSION..=PROTOCOL_VERSION`.
//! Unknown fields and unknown message kinds are ignored, so additive changes
//! do not require a version bump.

pub mod client;
pub mod codec;
pub mod message;
pub mod transport;
pub mod types;

pub use client::{ClientConfig, Directive, InstanceClient};
pub use codec::{
    Envelope, ProtocolError, SequenceTracker, MAX_FRAME_LEN, MIN_SUPPORTED_VERSION,
    PROTOCOL_VERSION,
};
pub use message::{Message, RejectCode};
pub use transport::{FrameReader, FrameWriter, FramedConnection};
pub use types::{
    current_timestamp, HealthStatus, InstanceDescriptor, InstanceId, PlayerId, RequestId,
};
