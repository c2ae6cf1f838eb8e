//! Keep-alive payloads.
//!
//! ```text
//! Client ──[Beat { sequence }]──────► Device     (every interval)
//! Device ──[BeatAck { sequence }]───► Client
//! ```
//!
//! The device may drop individual acks on a lossy link; the client
//! tolerates gaps up to its silence tolerance.

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::proto;

/// One keep-alive beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beat {
    /// Monotonically increasing beat number, starting at 1.
    pub sequence: u64,
}

impl Beat {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        proto::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        proto::decode(bytes)
    }
}

/// Acknowledgment for a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatAck {
    /// Sequence number of the acknowledged beat.
    pub sequence: u64,
}

impl BeatAck {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        proto::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        proto::decode(bytes)
    }
}
