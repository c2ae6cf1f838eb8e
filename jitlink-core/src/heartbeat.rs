//! Keep-alive heartbeat loop.
//!
//! Holds the device connection open by exchanging periodic beats on a
//! dedicated sub-channel. The loop tolerates individual lost acks —
//! some loss is expected on real links — and only fails after
//! sustained silence, a closed channel, or a malformed ack. It never
//! re-establishes a lost session by itself: the caller restarts it so
//! retry policy stays visible.

use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::proto::heartbeat::{Beat, BeatAck};
use crate::transport::Channel;

// ── Config ───────────────────────────────────────────────────────

/// Tuning for the beat loop.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between beats.
    pub interval: Duration,
    /// How long to wait for an ack before counting a miss.
    pub ack_timeout: Duration,
    /// Consecutive misses tolerated before the loop fails.
    pub miss_tolerance: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(10),
            miss_tolerance: 3,
        }
    }
}

// ── State ────────────────────────────────────────────────────────

/// Observable status of the heartbeat loop.
///
/// Mutated only by the loop itself; read through the coordinator's
/// status queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum HeartbeatState {
    /// No loop running.
    #[default]
    Idle,
    Running {
        /// When the loop started.
        since: Instant,
        /// When the last ack arrived, if any.
        last_ack: Option<Instant>,
    },
    /// The loop ended with a terminal error.
    Failed(String),
}

impl HeartbeatState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Outcome class of a heartbeat report.
///
/// `Progress` reports are transient; every other code is terminal and
/// arrives at most once, as the loop's final event.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatCode {
    Progress = 0,
    /// Clean shutdown on request.
    Stopped = 1,
    /// The device closed the channel.
    ChannelClosed = 2,
    /// No acks for longer than the tolerance allows.
    SilenceExceeded = 3,
    /// The device sent an ack the client cannot parse.
    ProtocolError = 4,
}

/// One heartbeat report, with a display-ready message.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub code: HeartbeatCode,
    pub message: String,
}

impl HeartbeatEvent {
    pub fn is_terminal(&self) -> bool {
        self.code != HeartbeatCode::Progress
    }
}

// ── Service ──────────────────────────────────────────────────────

struct ActiveLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the beat loop and its observable state.
pub struct HeartbeatService {
    config: HeartbeatConfig,
    state_tx: watch::Sender<HeartbeatState>,
    state_rx: watch::Receiver<HeartbeatState>,
    active: Mutex<Option<ActiveLoop>>,
}

impl HeartbeatService {
    pub fn new(config: HeartbeatConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(HeartbeatState::Idle);
        Self {
            config,
            state_tx,
            state_rx,
            active: Mutex::new(None),
        }
    }

    /// Current loop status snapshot.
    pub fn state(&self) -> HeartbeatState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn state_receiver(&self) -> watch::Receiver<HeartbeatState> {
        self.state_rx.clone()
    }

    /// Start beating on `channel`, replacing any previous loop.
    ///
    /// Reports arrive on the returned receiver: many `Progress`
    /// events, then exactly one terminal event when the loop ends.
    pub async fn start(&self, channel: Box<dyn Channel>) -> mpsc::UnboundedReceiver<HeartbeatEvent> {
        self.stop().await;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(beat_loop(
            channel,
            self.config.clone(),
            self.state_tx.clone(),
            event_tx,
            stop_rx,
        ));

        *self.active.lock().await = Some(ActiveLoop { stop_tx, handle });
        event_rx
    }

    /// Stop the loop and wait for it to finish.
    ///
    /// No event is delivered after this returns. No-op when idle.
    pub async fn stop(&self) {
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            let _ = active.stop_tx.send(true);
            let _ = active.handle.await;
        }
    }
}

// ── Loop ─────────────────────────────────────────────────────────

fn emit(tx: &mpsc::UnboundedSender<HeartbeatEvent>, code: HeartbeatCode, message: String) {
    debug!(?code, %message, "heartbeat report");
    let _ = tx.send(HeartbeatEvent { code, message });
}

async fn beat_loop(
    mut channel: Box<dyn Channel>,
    config: HeartbeatConfig,
    state_tx: watch::Sender<HeartbeatState>,
    event_tx: mpsc::UnboundedSender<HeartbeatEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let since = Instant::now();
    let _ = state_tx.send(HeartbeatState::Running {
        since,
        last_ack: None,
    });

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sequence: u64 = 0;
    let mut consecutive_misses: u32 = 0;

    let fail = |state_tx: &watch::Sender<HeartbeatState>, reason: &str| {
        let _ = state_tx.send(HeartbeatState::Failed(reason.to_string()));
    };

    'beats: loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    emit(&event_tx, HeartbeatCode::Stopped, "heartbeat stopped".into());
                    let _ = state_tx.send(HeartbeatState::Idle);
                    break 'beats;
                }
            }
            _ = ticker.tick() => {
                sequence += 1;
                let beat = match (Beat { sequence }).to_bytes() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        emit(&event_tx, HeartbeatCode::ProtocolError, format!("could not encode beat: {e}"));
                        fail(&state_tx, "beat encoding failed");
                        break 'beats;
                    }
                };

                if channel.send(beat.into()).await.is_err() {
                    let message = "device closed the heartbeat channel".to_string();
                    emit(&event_tx, HeartbeatCode::ChannelClosed, message.clone());
                    fail(&state_tx, &message);
                    break 'beats;
                }

                let ack = tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            emit(&event_tx, HeartbeatCode::Stopped, "heartbeat stopped".into());
                            let _ = state_tx.send(HeartbeatState::Idle);
                            break 'beats;
                        }
                        continue 'beats;
                    }
                    result = tokio::time::timeout(config.ack_timeout, channel.receive()) => result,
                };

                match ack {
                    Ok(Ok(Some(frame))) => match BeatAck::from_bytes(&frame) {
                        Ok(ack) => {
                            consecutive_misses = 0;
                            let _ = state_tx.send(HeartbeatState::Running {
                                since,
                                last_ack: Some(Instant::now()),
                            });
                            emit(
                                &event_tx,
                                HeartbeatCode::Progress,
                                format!("beat {} acknowledged", ack.sequence),
                            );
                        }
                        Err(e) => {
                            let message = format!("malformed heartbeat ack: {e}");
                            emit(&event_tx, HeartbeatCode::ProtocolError, message.clone());
                            fail(&state_tx, &message);
                            break 'beats;
                        }
                    },
                    Ok(Ok(None)) => {
                        let message = "device closed the heartbeat channel".to_string();
                        emit(&event_tx, HeartbeatCode::ChannelClosed, message.clone());
                        fail(&state_tx, &message);
                        break 'beats;
                    }
                    Ok(Err(e)) => {
                        let message = format!("heartbeat channel error: {e}");
                        emit(&event_tx, HeartbeatCode::ChannelClosed, message.clone());
                        fail(&state_tx, &message);
                        break 'beats;
                    }
                    Err(_) => {
                        consecutive_misses += 1;
                        if consecutive_misses >= config.miss_tolerance {
                            let message = format!(
                                "no acknowledgment for {consecutive_misses} consecutive beats"
                            );
                            emit(&event_tx, HeartbeatCode::SilenceExceeded, message.clone());
                            fail(&state_tx, &message);
                            break 'beats;
                        }
                        // A single dropped ack is expected on lossy links.
                        warn!(sequence, consecutive_misses, "beat unacknowledged");
                        emit(
                            &event_tx,
                            HeartbeatCode::Progress,
                            format!(
                                "beat {sequence} unacknowledged ({consecutive_misses}/{})",
                                config.miss_tolerance
                            ),
                        );
                    }
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
