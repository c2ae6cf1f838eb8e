//! Streaming system log relay.
//!
//! Opens a streaming sub-channel and turns the raw byte stream into
//! discrete log lines, delivered in arrival order. Partial trailing
//! data is buffered until a later read completes the line. The relay
//! runs until the device closes the channel (reported once) or
//! [`SyslogRelay::stop`] cancels it; stop waits for the loop to wind
//! down, so no line or error is delivered after it returns.

use bytes::BytesMut;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::LinkError;
use crate::transport::Channel;

// ── LineSplitter ─────────────────────────────────────────────────

/// Accumulates raw chunks and yields complete `\n`-terminated lines.
///
/// A trailing `\r` is stripped so CRLF devices look like LF devices.
/// Bytes after the last terminator stay buffered for the next chunk.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: BytesMut,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            let mut end = line.len() - 1;
            if end > 0 && line[end - 1] == b'\r' {
                end -= 1;
            }
            lines.push(String::from_utf8_lossy(&line[..end]).into_owned());
        }
        lines
    }

    /// Bytes buffered without a terminator yet.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

/// Strip the syslog header up to the first `": "`, if present.
///
/// Device log lines lead with process/subsystem metadata; consumers
/// that only want the message text can run lines through this.
pub fn message_part(line: &str) -> &str {
    match line.split_once(": ") {
        Some((_, message)) => message,
        None => line,
    }
}

// ── State and events ─────────────────────────────────────────────

/// Observable status of the relay. Mutated only by the relay itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RelayState {
    #[default]
    Idle,
    Streaming,
    /// Cancelled by an explicit stop.
    Stopped,
    /// The stream ended with a transport error.
    Failed(String),
}

impl RelayState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }
}

/// What the relay delivers to its consumer.
#[derive(Debug)]
pub enum SyslogEvent {
    /// One complete log line, in arrival order.
    Line(String),
    /// Terminal transport error; the stream is over.
    Error(LinkError),
}

// ── Relay ────────────────────────────────────────────────────────

struct ActiveRelay {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the streaming read loop and its observable state.
pub struct SyslogRelay {
    state_tx: watch::Sender<RelayState>,
    state_rx: watch::Receiver<RelayState>,
    active: Mutex<Option<ActiveRelay>>,
}

impl Default for SyslogRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl SyslogRelay {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(RelayState::Idle);
        Self {
            state_tx,
            state_rx,
            active: Mutex::new(None),
        }
    }

    /// Current relay status snapshot.
    pub fn state(&self) -> RelayState {
        self.state_rx.borrow().clone()
    }

    /// Begin streaming from `channel`.
    ///
    /// If a relay is already running it is stopped first; there is
    /// never more than one concurrent stream.
    pub async fn start(&self, channel: Box<dyn Channel>) -> mpsc::UnboundedReceiver<SyslogEvent> {
        self.stop().await;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(relay_loop(
            channel,
            self.state_tx.clone(),
            event_tx,
            stop_rx,
        ));

        *self.active.lock().await = Some(ActiveRelay { stop_tx, handle });
        event_rx
    }

    /// Cancel the stream and wait for the loop to finish.
    ///
    /// Idempotent: stopping an idle relay is a no-op. After this
    /// returns, no further [`SyslogEvent`] is delivered.
    pub async fn stop(&self) {
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            let _ = active.stop_tx.send(true);
            let _ = active.handle.await;
            // A loop that already ended recorded its own terminal state.
            if self.state_rx.borrow().is_streaming() {
                let _ = self.state_tx.send(RelayState::Stopped);
            }
        }
    }
}

async fn relay_loop(
    mut channel: Box<dyn Channel>,
    state_tx: watch::Sender<RelayState>,
    event_tx: mpsc::UnboundedSender<SyslogEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let _ = state_tx.send(RelayState::Streaming);
    let mut splitter = LineSplitter::new();
    let mut delivered: u64 = 0;

    loop {
        let chunk = tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!(delivered, "syslog relay cancelled");
                    return;
                }
                continue;
            }
            received = channel.receive() => received,
        };

        match chunk {
            Ok(Some(chunk)) => {
                for line in splitter.push(&chunk) {
                    delivered += 1;
                    if event_tx.send(SyslogEvent::Line(line)).is_err() {
                        // Consumer went away; streaming on is pointless.
                        let _ = state_tx.send(RelayState::Stopped);
                        return;
                    }
                }
            }
            Ok(None) => {
                let _ = state_tx.send(RelayState::Failed("log channel closed".into()));
                let _ = event_tx.send(SyslogEvent::Error(LinkError::ConnectionLost));
                return;
            }
            Err(e) => {
                let _ = state_tx.send(RelayState::Failed(e.to_string()));
                let _ = event_tx.send(SyslogEvent::Error(e));
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
