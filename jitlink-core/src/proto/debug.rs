//! Debug-channel payloads — attach, JIT enabling, process output.
//!
//! # Exchange order
//!
//! ```text
//! Client ──[LaunchSuspended | VerifyPid]─► Device    (resolve target)
//! Client ──[Attach { pid }]──────────────► Device
//! Client ──[SetExecFlags { pid, flags }]─► Device    (JIT enabling)
//! Client ──[Resume { pid }]──────────────► Device
//! Device ──[Output | Exited]─────────────► Client    (repeated, async)
//! Client ──[Detach]──────────────────────► Device    (at any point)
//! ```
//!
//! The device answers each request with one [`DebugReply`] before the
//! next request is sent. After `Resume` succeeds the channel switches
//! to asynchronous [`DebugNotice`] frames until exit or detach. The
//! flag sequence mirrors what a debugger must do to let a target
//! generate code at runtime: attach first, mark pages, then resume.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::LinkError;
use crate::proto;

// ── ExecFlags ────────────────────────────────────────────────────

bitflags! {
    /// Memory permissions requested for the target's code pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecFlags: u32 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl ExecFlags {
    /// The configuration a JIT-capable runtime needs.
    pub fn jit() -> Self {
        ExecFlags::READ | ExecFlags::WRITE | ExecFlags::EXECUTE
    }
}

// ── Requests ─────────────────────────────────────────────────────

/// Commands sent on the debug channel.
///
/// `SetExecFlags` carries raw bits on the wire; use [`ExecFlags`] to
/// build and interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugRequest {
    /// Launch the app suspended, before any user code runs.
    LaunchSuspended { bundle_id: String },
    /// Check that an already-running process exists.
    VerifyPid { pid: u32 },
    /// Attach the debugger to the target process.
    Attach { pid: u32 },
    /// Mark the target's memory pages with the given permissions.
    SetExecFlags { pid: u32, flags: u32 },
    /// Resume the suspended/stopped target.
    Resume { pid: u32 },
    /// End the session, leaving the target running.
    Detach,
}

impl DebugRequest {
    pub fn set_exec_flags(pid: u32, flags: ExecFlags) -> Self {
        DebugRequest::SetExecFlags {
            pid,
            flags: flags.bits(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        proto::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        proto::decode(bytes)
    }
}

// ── Replies ──────────────────────────────────────────────────────

/// Direct answer to a [`DebugRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugReply {
    /// Request succeeded.
    Ok,
    /// Suspended launch succeeded; the target's pid.
    Launched { pid: u32 },
    /// The bundle identifier is not installed.
    UnknownBundle { bundle_id: String },
    /// No such process.
    UnknownPid { pid: u32 },
    /// The device declined the request (launch daemon refusal,
    /// attach denied).
    Refused { reason: String },
    /// The device could not process the request.
    Error { message: String },
}

impl DebugReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        proto::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        proto::decode(bytes)
    }
}

// ── Notices ──────────────────────────────────────────────────────

/// Asynchronous frames streamed by the device once the target runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebugNotice {
    /// A chunk of the target's log/stdout output.
    Output { data: Vec<u8> },
    /// The target exited; the session is over.
    Exited { status: i32 },
}

impl DebugNotice {
    pub fn to_bytes(&self) -> Result<Vec<u8>, LinkError> {
        proto::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LinkError> {
        proto::decode(bytes)
    }
}

// ── Tests ────────────────────────────────────────────────────────
