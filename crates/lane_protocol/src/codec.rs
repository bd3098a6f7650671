//! Versioned envelope and its JSON encoding.

use crate::message::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version this build speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// Oldest peer version still accepted during a rolling upgrade.
pub const MIN_SUPPORTED_VERSION: u16 = 1;

/// Largest frame body accepted off the wire.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors raised while encoding, decoding or transporting protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unsupported protocol version {version} (supported {min}..={max})")]
    UnsupportedVersion { version: u16, min: u16, max: u16 },
    #[error("Frame of {0} bytes exceeds the 1 MiB limit")]
    FrameTooLarge(usize),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

/// One framed protocol message.
///
/// `seq` increases monotonically per connection and direction; receivers use
/// it to drop replays and out-of-order duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub seq: u64,
    pub message: Message,
}

/// Header fields read before the body so that a version mismatch is reported
/// as such rather than as a body decode failure.
#[derive(Deserialize)]
struct Header {
    version: u16,
}

impl Envelope {
    pub fn new(seq: u64, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            seq,
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let header: Header = serde_json::from_slice(bytes)?;
        if !(MIN_SUPPORTED_VERSION..=PROTOCOL_VERSION).contains(&header.version) {
            return Err(ProtocolError::UnsupportedVersion {
                version: header.version,
                min: MIN_SUPPORTED_VERSION,
                max: PROTOCOL_VERSION,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Tracks the last sequence number applied on one direction of a connection.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `seq` and returns true if it is newer than anything seen so far.
    pub fn accept(&mut self, seq: u64) -> bool {
        match self.last {
            Some(last) if seq <= last => false,
            _ => {
                self.last = Some(seq);
                true
            }
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HealthStatus;

    #[test]
    fn decode_rejects_future_version() {
        let json = br#"{"version":7,"seq":1,"message":{"kind":"HEARTBEAT"}}"#;
        match Envelope::decode(json) {
            Err(ProtocolError::UnsupportedVersion { version, .. }) => assert_eq!(version, 7),
            other => panic!("expected version error, got {other:?}"),
        }
    }

    #[test]
    fn decode_ignores_unknown_envelope_fields() {
        let json = br#"{"version":1,"seq":4,"trace":"abc","message":{"kind":"HEARTBEAT","status":"healthy"}}"#;
        let envelope = Envelope::decode(json).unwrap();
        assert_eq!(envelope.seq, 4);
        assert_eq!(
            envelope.message,
            Message::Heartbeat {
                status: HealthStatus::Healthy
            }
        );
    }

    #[test]
    fn tracker_drops_replays_and_reordering() {
        let mut tracker = SequenceTracker::new();
        assert!(tracker.accept(1));
        assert!(tracker.accept(2));
        assert!(!tracker.accept(2));
        assert!(tracker.accept(5));
        assert!(!tracker.accept(3));
        assert_eq!(tracker.last(), Some(5));
    }
}
