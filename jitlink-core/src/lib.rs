//! # jitlink-core
//!
//! Client library that turns one paired device connection into a set
//! of concurrent, independently-lifecycled protocol sessions.
//!
//! This crate contains:
//! - **Coordinator**: [`SessionCoordinator`] — owns the pairing
//!   credential and the single device connection, runs the loops
//! - **Pairing**: [`PairingStore`] with pluggable credential discovery
//! - **Transport**: the `Transport`/`Connection`/`Channel` seam, an
//!   in-memory pipe, and a framed TCP bridge implementation
//! - **Sessions**: [`HeartbeatService`], [`DebugSession`] (attach +
//!   JIT enabling), [`SyslogRelay`]
//! - **App service**: catalog queries, icon fetch/decoding, launch
//! - **Proto**: per-channel payload types
//! - **Error**: [`LinkError`] — typed, `thiserror`-based hierarchy

pub mod bundle;
pub mod catalog;
pub mod codec;
pub mod coordinator;
pub mod debug;
pub mod error;
pub mod heartbeat;
pub mod icon;
pub mod launch;
pub mod net;
pub mod pairing;
pub mod proto;
pub mod syslog;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bundle::BundleId;
pub use catalog::AppCatalogService;
pub use codec::{LinkCodec, MAX_FRAME_SIZE};
pub use coordinator::{ConnectionHealth, SessionCoordinator};
pub use debug::{DebugEvent, DebugHandle, DebugPhase, DebugSession, DebugTarget};
pub use error::LinkError;
pub use heartbeat::{
    HeartbeatCode, HeartbeatConfig, HeartbeatEvent, HeartbeatService, HeartbeatState,
};
pub use icon::{DecodedIcon, IconDecoder, IconService, PngIconDecoder};
pub use launch::LaunchService;
pub use net::TcpTransport;
pub use pairing::{FilePairingSource, PairingCredential, PairingSource, PairingStore};
pub use proto::apps::{AppKind, AppRecord, AppScope};
pub use proto::debug::ExecFlags;
pub use syslog::{LineSplitter, RelayState, SyslogEvent, SyslogRelay};
pub use transport::{Channel, ChannelKind, Connection, SharedChannel, Transport};
