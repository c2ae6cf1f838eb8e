//! App-service payloads — catalog queries, icon fetches, launches.
//!
//! ```text
//! Client ──[ListApps { scope }]─────► Device
//! Device ──[Apps { apps }]──────────► Client
//!
//! Client ──[FetchIcon { bundle_id }]► Device
//! Device ──[Icon | NoIcon | UnknownBundle]► Client
//!
//! Client ──[Launch { bundle_id }]───► Device
//! Device ──[Launched | LaunchRefused | UnknownBundle]► Client
//! ```
//!
//! All three operations share one sub-channel; exchanges are strictly
//! one request, one reply.

use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::proto;

// ── Scope and records ────────────────────────────────────────────

/// Which slice of the installed-app catalog a query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppScope {
    /// User-installed apps only.
    User,
    /// User and visible system apps.
    All,
    /// System apps hidden from the home screen.
    HiddenSystem,
}

/// How the device classifies an installed app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppKind {
    User,
    System,
    HiddenSystem,
}

impl AppScope {
    /// Whether an app of `kind` belongs in this scope's results.
    pub fn includes(&self, kind: AppKind) -> bool {
        match self {
            AppScope::User => kind == AppKind::User,
            AppScope::All => matches!(kind, AppKind::User | AppKind::System),
            AppScope::HiddenSystem => kind == AppKind::HiddenSystem,
        }
    }
}

/// One installed application, as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub bundle_id: String,
    pub display_name: String,
    pub kind: AppKind,
}

// ── Requests / replies ───────────────────────────────────────────

/// Requests understood by the app-service channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppServiceRequest {
    ListApps { scope: AppScope },
    FetchIcon { bundle_id: String },
    Launch { bundle_id: String },
}

impl AppServiceRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        proto::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        proto::decode(bytes)
    }
}

/// Replies produced by the app-service channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppServiceReply {
    /// Catalog query result.
    Apps { apps: Vec<AppRecord> },
    /// Raw encoded icon data for the requested app.
    Icon { bundle_id: String, data: Vec<u8> },
    /// The app exists but has no icon data.
    NoIcon { bundle_id: String },
    /// The bundle identifier is not installed.
    UnknownBundle { bundle_id: String },
    /// Launch succeeded; the process is running.
    Launched { bundle_id: String, pid: u32 },
    /// The launch daemon declined.
    LaunchRefused { bundle_id: String, reason: String },
    /// The device could not process the request at all.
    Error { message: String },
}

impl AppServiceReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        proto::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        proto::decode(bytes)
    }
}

// ── Tests ────────────────────────────────────────────────────────
