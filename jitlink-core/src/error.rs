//! Domain-specific error types for the device link.
//!
//! All fallible operations return `Result<T, LinkError>`.
//! No panics on invalid input — every error is typed and carries a
//! message suitable for direct display.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the device link.
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Pairing Errors ───────────────────────────────────────────
    /// No pairing credential could be located on the host.
    #[error("no pairing credential found")]
    NoPairingFound,

    /// A pairing credential was found but failed validation.
    #[error("pairing credential invalid: {0}")]
    PairingInvalid(String),

    // ── Session Errors ───────────────────────────────────────────
    /// The device connection dropped under an active session.
    #[error("device connection lost")]
    ConnectionLost,

    /// A debug session is already active on this coordinator.
    #[error("a debug session is already active")]
    SessionBusy,

    /// The bundle identifier is unknown to the device.
    #[error("app not installed: {0}")]
    AppNotFound(String),

    /// No running process with the given pid.
    #[error("no running process with pid {0}")]
    ProcessNotFound(u32),

    /// The device has no icon data for the app.
    #[error("no icon available for {0}")]
    IconUnavailable(String),

    /// The device declined to launch the app.
    #[error("launch refused for {bundle_id}: {reason}")]
    LaunchRefused { bundle_id: String, reason: String },

    /// The device sent a response the client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation was cancelled by an explicit stop or detach.
    #[error("operation cancelled")]
    Cancelled,

    // ── Framing Errors ───────────────────────────────────────────
    /// Received bytes that do not start with a valid frame magic.
    #[error("invalid frame magic")]
    InvalidMagic,

    /// The frame payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    // ── Connection Errors ────────────────────────────────────────
    /// The underlying I/O layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl LinkError {
    /// Short machine-readable tag for the error kind, used in
    /// diagnostics and event messages.
    pub fn kind(&self) -> &'static str {
        match self {
            LinkError::NoPairingFound => "no-pairing",
            LinkError::PairingInvalid(_) => "pairing-invalid",
            LinkError::ConnectionLost => "connection-lost",
            LinkError::SessionBusy => "session-busy",
            LinkError::AppNotFound(_) => "app-not-found",
            LinkError::ProcessNotFound(_) => "process-not-found",
            LinkError::IconUnavailable(_) => "icon-unavailable",
            LinkError::LaunchRefused { .. } => "launch-refused",
            LinkError::Protocol(_) => "protocol",
            LinkError::Cancelled => "cancelled",
            LinkError::InvalidMagic => "invalid-magic",
            LinkError::ChecksumMismatch => "checksum-mismatch",
            LinkError::FrameTooLarge { .. } => "frame-too-large",
            LinkError::UnknownVariant { .. } => "unknown-variant",
            LinkError::Io(_) => "io",
            LinkError::ChannelClosed => "channel-closed",
            LinkError::Timeout(_) => "timeout",
            LinkError::Encoding(_) => "encoding",
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LinkError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for LinkError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        LinkError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        LinkError::Encoding(e.to_string())
    }
}
