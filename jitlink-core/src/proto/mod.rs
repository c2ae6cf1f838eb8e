//! Per-channel protocol payloads.
//!
//! Each sub-channel exchanges bincode-encoded payload structs defined
//! in its own module. The real device protocols these model are
//! externally specified; the peer (bridge or test device) speaks the
//! same structs, and a different encoding can be swapped in behind the
//! channel seam without touching the services.

pub mod apps;
pub mod debug;
pub mod heartbeat;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::LinkError;

/// Encode a payload for transmission on a channel.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LinkError> {
    Ok(bincode::serialize(value)?)
}

/// Decode a payload received from a channel.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LinkError> {
    Ok(bincode::deserialize(bytes)?)
}
