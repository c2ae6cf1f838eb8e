//! Transport seam — the narrow interface the coordinator uses to reach
//! a device.
//!
//! ```text
//! Transport ──open(credential)──► Connection
//! Connection ──open_channel(kind)──► Channel   (one per protocol)
//! Channel    ──send / receive──► framed byte payloads
//! ```
//!
//! The concrete wire plumbing (USB multiplexing, TCP bridge, in-memory
//! test pipe) lives behind these traits. Every protocol session in this
//! crate borrows exactly one sub-channel from the single live
//! `Connection`; nothing opens a second competing connection to the
//! same device.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};

use crate::error::LinkError;
use crate::pairing::PairingCredential;

// ── ChannelKind ──────────────────────────────────────────────────

/// The protocol a sub-channel speaks.
///
/// Distinct kinds may be multiplexed concurrently over one device
/// connection; within a kind, request/response ordering is FIFO.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Keep-alive beat/ack exchange.
    Heartbeat = 0x01,
    /// Debugger attach, JIT enabling, and process output.
    Debug = 0x02,
    /// App catalog queries, icon fetches, and direct launches.
    AppService = 0x03,
    /// Streaming system log relay.
    Syslog = 0x04,
}

impl TryFrom<u32> for ChannelKind {
    type Error = LinkError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ChannelKind::Heartbeat),
            0x02 => Ok(ChannelKind::Debug),
            0x03 => Ok(ChannelKind::AppService),
            0x04 => Ok(ChannelKind::Syslog),
            _ => Err(LinkError::UnknownVariant {
                type_name: "ChannelKind",
                value: value as u64,
            }),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// ── Traits ───────────────────────────────────────────────────────

/// Opens duplex connections to a device given a pairing credential.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, credential: &PairingCredential) -> Result<Box<dyn Connection>, LinkError>;
}

/// A live, authenticated device connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a sub-channel for the given protocol.
    async fn open_channel(&self, kind: ChannelKind) -> Result<Box<dyn Channel>, LinkError>;
}

/// One framed duplex sub-channel.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), LinkError>;

    /// Receive the next frame. `Ok(None)` means the peer closed the
    /// channel cleanly.
    async fn receive(&mut self) -> Result<Option<Bytes>, LinkError>;
}

// ── SharedChannel ────────────────────────────────────────────────

/// A channel shared by several one-shot services, serialized so each
/// request/response exchange completes before the next begins.
#[derive(Clone)]
pub struct SharedChannel {
    inner: Arc<Mutex<Box<dyn Channel>>>,
}

impl SharedChannel {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    /// Send one request frame and wait for its reply.
    ///
    /// The channel lock is held across the full round trip, so
    /// concurrent callers observe strict FIFO ordering.
    pub async fn exchange(&self, frame: Bytes) -> Result<Bytes, LinkError> {
        let mut channel = self.inner.lock().await;
        channel.send(frame).await?;
        match channel.receive().await? {
            Some(reply) => Ok(reply),
            None => Err(LinkError::ConnectionLost),
        }
    }
}

// ── In-memory pipe ───────────────────────────────────────────────

/// One end of an in-memory channel pair.
///
/// Frames written to one end arrive at the other in order. Dropping an
/// end closes the peer's receive side. Used by tests and local
/// loopback setups.
pub struct PipeChannel {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl Channel for PipeChannel {
    async fn send(&mut self, frame: Bytes) -> Result<(), LinkError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| LinkError::ConnectionLost)
    }

    async fn receive(&mut self) -> Result<Option<Bytes>, LinkError> {
        Ok(self.rx.recv().await)
    }
}

/// Create a cross-connected pair of in-memory channels.
pub fn pipe(capacity: usize) -> (PipeChannel, PipeChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        PipeChannel { tx: a_tx, rx: a_rx },
        PipeChannel { tx: b_tx, rx: b_rx },
    )
}

// ── Tests ────────────────────────────────────────────────────────
