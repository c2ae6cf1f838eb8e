//! Debugger-attach session with JIT enabling.
//!
//! Drives a target process through the attach sequence on the debug
//! sub-channel and then relays its output until exit or detach:
//!
//! ```text
//!  Idle ──► Resolving ──► Launching ─┐
//!                └──────► Locating ──┴─► Attaching ──► JitEnabling
//!                                                          │
//!                        Detached ◄──── Attached ◄─────────┘
//!                            │              │
//!                            └── Failed ◄───┘   (any step may fail)
//! ```
//!
//! Bundle-id attach launches the app suspended and takes the pid from
//! the launch step; pid attach verifies the process is live first.
//! JIT enabling always runs in the required order: attach, mark the
//! target's pages read/write/execute, resume. Only one session may be
//! active per coordinator.

use std::time::Instant;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bundle::BundleId;
use crate::catalog::AppCatalogService;
use crate::error::LinkError;
use crate::proto::debug::{DebugNotice, DebugReply, DebugRequest, ExecFlags};
use crate::syslog::LineSplitter;
use crate::transport::Channel;

// ── DebugPhase ───────────────────────────────────────────────────

/// Attach progress, with validated transitions.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DebugPhase {
    /// No session. Initial state.
    #[default]
    Idle,
    /// Resolving the target (bundle lookup or pid liveness).
    Resolving,
    /// Asking the device to launch the app suspended.
    Launching,
    /// Locating the already-running process.
    Locating,
    /// Debug channel attach request in flight.
    Attaching,
    /// Issuing the execution-flag and resume commands.
    JitEnabling,
    /// Target running with JIT enabled; output is streaming.
    Attached { since: Instant },
    /// Session ended cleanly (process exit or explicit detach).
    Detached,
    /// Session ended with an error.
    Failed,
}

impl std::fmt::Display for DebugPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Resolving => write!(f, "Resolving"),
            Self::Launching => write!(f, "Launching"),
            Self::Locating => write!(f, "Locating"),
            Self::Attaching => write!(f, "Attaching"),
            Self::JitEnabling => write!(f, "JitEnabling"),
            Self::Attached { .. } => write!(f, "Attached"),
            Self::Detached => write!(f, "Detached"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl DebugPhase {
    /// A session in this phase holds the debug channel.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Detached | Self::Failed)
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached { .. })
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Idle`, `Detached`, `Failed` (a fresh session).
    pub fn begin_resolve(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Idle | Self::Detached | Self::Failed => {
                *self = Self::Resolving;
                Ok(())
            }
            _ => Err(LinkError::Protocol(
                "cannot resolve: a session is already active".into(),
            )),
        }
    }

    /// Valid from: `Resolving`.
    pub fn begin_launch(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Resolving => {
                *self = Self::Launching;
                Ok(())
            }
            _ => Err(LinkError::Protocol(
                "cannot launch: target not resolving".into(),
            )),
        }
    }

    /// Valid from: `Resolving`.
    pub fn begin_locate(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Resolving => {
                *self = Self::Locating;
                Ok(())
            }
            _ => Err(LinkError::Protocol(
                "cannot locate: target not resolving".into(),
            )),
        }
    }

    /// Valid from: `Launching`, `Locating`.
    pub fn begin_attach(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Launching | Self::Locating => {
                *self = Self::Attaching;
                Ok(())
            }
            _ => Err(LinkError::Protocol(
                "cannot attach: no resolved target".into(),
            )),
        }
    }

    /// Valid from: `Attaching`.
    pub fn begin_jit_enable(&mut self) -> Result<(), LinkError> {
        match self {
            Self::Attaching => {
                *self = Self::JitEnabling;
                Ok(())
            }
            _ => Err(LinkError::Protocol(
                "cannot enable JIT: debugger not attached".into(),
            )),
        }
    }

    /// Valid from: `JitEnabling`.
    pub fn complete_attach(&mut self) -> Result<(), LinkError> {
        match self {
            Self::JitEnabling => {
                *self = Self::Attached {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(LinkError::Protocol(
                "cannot complete attach: JIT enabling not done".into(),
            )),
        }
    }

    /// Clean end of session. Valid from any active phase.
    pub fn finish_detach(&mut self) -> Result<(), LinkError> {
        if self.is_active() {
            *self = Self::Detached;
            Ok(())
        } else {
            Err(LinkError::Protocol("cannot detach: no active session".into()))
        }
    }

    /// Force the terminal `Failed` state from anywhere.
    pub fn fail(&mut self) {
        *self = Self::Failed;
    }
}

// ── Events and targets ───────────────────────────────────────────

/// What a debug session reports while it runs.
///
/// `Log` lines arrive in production order. Exactly one of `Exited`,
/// `Detached`, or `Failed` ends the stream.
#[derive(Debug)]
pub enum DebugEvent {
    /// The session advanced to a new phase.
    PhaseChanged(DebugPhase),
    /// A diagnostic or target-output line.
    Log(String),
    /// The target is running with JIT enabled.
    Attached { pid: u32 },
    /// The target exited on its own.
    Exited { status: i32 },
    /// The session ended on request.
    Detached,
    /// The session ended with an error.
    Failed(LinkError),
}

/// What to attach to.
#[derive(Debug, Clone)]
pub enum DebugTarget {
    Bundle(BundleId),
    Pid(u32),
}

impl std::fmt::Display for DebugTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bundle(bundle_id) => write!(f, "{bundle_id}"),
            Self::Pid(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// Caller's view of a running session.
pub struct DebugHandle {
    events: mpsc::UnboundedReceiver<DebugEvent>,
}

impl DebugHandle {
    /// Next session event, or `None` once the session is over and
    /// drained.
    pub async fn next_event(&mut self) -> Option<DebugEvent> {
        self.events.recv().await
    }

    pub fn into_events(self) -> mpsc::UnboundedReceiver<DebugEvent> {
        self.events
    }
}

// ── DebugSession ─────────────────────────────────────────────────

struct ActiveSession {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the single debug session slot of a coordinator.
pub struct DebugSession {
    phase_tx: watch::Sender<DebugPhase>,
    phase_rx: watch::Receiver<DebugPhase>,
    active: Mutex<Option<ActiveSession>>,
}

impl Default for DebugSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugSession {
    pub fn new() -> Self {
        let (phase_tx, phase_rx) = watch::channel(DebugPhase::Idle);
        Self {
            phase_tx,
            phase_rx,
            active: Mutex::new(None),
        }
    }

    /// Current phase snapshot.
    pub fn phase(&self) -> DebugPhase {
        self.phase_rx.borrow().clone()
    }

    /// Subscribe to phase changes.
    pub fn phase_receiver(&self) -> watch::Receiver<DebugPhase> {
        self.phase_rx.clone()
    }

    /// Whether a session currently holds the debug channel.
    pub async fn is_active(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| !session.handle.is_finished())
    }

    /// Start attaching to `target` over `channel`.
    ///
    /// Returns immediately with the event stream; attach progress and
    /// the terminal outcome arrive as [`DebugEvent`]s. Fails with
    /// [`LinkError::SessionBusy`] while another session is active,
    /// leaving that session untouched.
    pub async fn attach(
        &self,
        target: DebugTarget,
        channel: Box<dyn Channel>,
        catalog: AppCatalogService,
    ) -> Result<DebugHandle, LinkError> {
        let mut active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            if !session.handle.is_finished() {
                return Err(LinkError::SessionBusy);
            }
        }

        info!(%target, "starting debug session");
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(session_loop(
            channel,
            target,
            catalog,
            PhaseTracker {
                phase: DebugPhase::Idle,
                phase_tx: self.phase_tx.clone(),
                event_tx: event_tx.clone(),
            },
            event_tx,
            stop_rx,
        ));

        *active = Some(ActiveSession { stop_tx, handle });
        Ok(DebugHandle { events: event_rx })
    }

    /// End the active session, leaving the target running.
    ///
    /// Safe to call from any task, concurrently with an in-progress
    /// attach. No event is delivered after this returns. No-op when
    /// no session is active.
    pub async fn detach(&self) {
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            let _ = active.stop_tx.send(true);
            let _ = active.handle.await;
        }
    }
}

// ── Session loop ─────────────────────────────────────────────────

/// Tracks the phase locally, publishing every change to the watch and
/// the event stream.
struct PhaseTracker {
    phase: DebugPhase,
    phase_tx: watch::Sender<DebugPhase>,
    event_tx: mpsc::UnboundedSender<DebugEvent>,
}

impl PhaseTracker {
    fn advance(
        &mut self,
        transition: fn(&mut DebugPhase) -> Result<(), LinkError>,
    ) -> Result<(), LinkError> {
        transition(&mut self.phase)?;
        self.publish();
        Ok(())
    }

    fn force_fail(&mut self) {
        self.phase.fail();
        self.publish();
    }

    fn detach(&mut self) {
        if self.phase.finish_detach().is_ok() {
            self.publish();
        }
    }

    fn publish(&self) {
        debug!(phase = %self.phase, "debug session phase");
        let _ = self.phase_tx.send(self.phase.clone());
        let _ = self
            .event_tx
            .send(DebugEvent::PhaseChanged(self.phase.clone()));
    }

    fn log(&self, message: String) {
        let _ = self.event_tx.send(DebugEvent::Log(message));
    }
}

async fn session_loop(
    mut channel: Box<dyn Channel>,
    target: DebugTarget,
    catalog: AppCatalogService,
    mut tracker: PhaseTracker,
    event_tx: mpsc::UnboundedSender<DebugEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    // Setup, cancellable by an early detach.
    let outcome = tokio::select! {
        _ = stop_rx.changed() => None,
        result = establish(&mut channel, &target, &catalog, &mut tracker) => Some(result),
    };

    let pid = match outcome {
        None => {
            let _ = send_request(&mut channel, DebugRequest::Detach).await;
            tracker.detach();
            let _ = event_tx.send(DebugEvent::Detached);
            return;
        }
        Some(Err(e)) => {
            tracker.log(format!("debug session failed: {e}"));
            tracker.force_fail();
            let _ = event_tx.send(DebugEvent::Failed(e));
            return;
        }
        Some(Ok(pid)) => pid,
    };

    let _ = event_tx.send(DebugEvent::Attached { pid });

    // Relay target output until exit, error, or detach.
    let mut splitter = LineSplitter::new();
    loop {
        let frame = tokio::select! {
            _ = stop_rx.changed() => {
                let _ = send_request(&mut channel, DebugRequest::Detach).await;
                tracker.detach();
                let _ = event_tx.send(DebugEvent::Detached);
                return;
            }
            received = channel.receive() => received,
        };

        match frame {
            Ok(Some(frame)) => match DebugNotice::from_bytes(&frame) {
                Ok(DebugNotice::Output { data }) => {
                    for line in splitter.push(&data) {
                        let _ = event_tx.send(DebugEvent::Log(line));
                    }
                }
                Ok(DebugNotice::Exited { status }) => {
                    info!(pid, status, "debug target exited");
                    tracker.detach();
                    let _ = event_tx.send(DebugEvent::Exited { status });
                    return;
                }
                Err(e) => {
                    tracker.force_fail();
                    let _ = event_tx.send(DebugEvent::Failed(e));
                    return;
                }
            },
            Ok(None) => {
                tracker.force_fail();
                let _ = event_tx.send(DebugEvent::Failed(LinkError::ConnectionLost));
                return;
            }
            Err(e) => {
                tracker.force_fail();
                let _ = event_tx.send(DebugEvent::Failed(e));
                return;
            }
        }
    }
}

/// Run the attach sequence through `JitEnabling`, returning the pid.
async fn establish(
    channel: &mut Box<dyn Channel>,
    target: &DebugTarget,
    catalog: &AppCatalogService,
    tracker: &mut PhaseTracker,
) -> Result<u32, LinkError> {
    tracker.advance(DebugPhase::begin_resolve)?;

    let pid = match target {
        DebugTarget::Bundle(bundle_id) => {
            let record = catalog
                .resolve(bundle_id)
                .await?
                .ok_or_else(|| LinkError::AppNotFound(bundle_id.to_string()))?;
            tracker.log(format!("resolved {} to {}", bundle_id, record.display_name));

            tracker.advance(DebugPhase::begin_launch)?;
            let reply = send_request(
                channel,
                DebugRequest::LaunchSuspended {
                    bundle_id: bundle_id.to_string(),
                },
            )
            .await?;
            match reply {
                DebugReply::Launched { pid } => {
                    tracker.log(format!("launched {bundle_id} suspended as pid {pid}"));
                    pid
                }
                DebugReply::UnknownBundle { bundle_id } => {
                    return Err(LinkError::AppNotFound(bundle_id));
                }
                DebugReply::Refused { reason } => {
                    return Err(LinkError::LaunchRefused {
                        bundle_id: bundle_id.to_string(),
                        reason,
                    });
                }
                other => return Err(unexpected_reply("launch", other)),
            }
        }
        DebugTarget::Pid(pid) => {
            tracker.advance(DebugPhase::begin_locate)?;
            let reply = send_request(channel, DebugRequest::VerifyPid { pid: *pid }).await?;
            match reply {
                DebugReply::Ok => *pid,
                DebugReply::UnknownPid { pid } => {
                    return Err(LinkError::ProcessNotFound(pid));
                }
                other => return Err(unexpected_reply("pid lookup", other)),
            }
        }
    };

    tracker.advance(DebugPhase::begin_attach)?;
    expect_ok(send_request(channel, DebugRequest::Attach { pid }).await?, "attach")?;

    tracker.advance(DebugPhase::begin_jit_enable)?;
    expect_ok(
        send_request(channel, DebugRequest::set_exec_flags(pid, ExecFlags::jit())).await?,
        "execution flags",
    )?;
    expect_ok(
        send_request(channel, DebugRequest::Resume { pid }).await?,
        "resume",
    )?;

    tracker.advance(DebugPhase::complete_attach)?;
    tracker.log(format!("pid {pid} resumed with JIT enabled"));
    Ok(pid)
}

async fn send_request(
    channel: &mut Box<dyn Channel>,
    request: DebugRequest,
) -> Result<DebugReply, LinkError> {
    channel.send(request.to_bytes()?.into()).await?;
    match channel.receive().await? {
        Some(frame) => DebugReply::from_bytes(&frame),
        None => Err(LinkError::ConnectionLost),
    }
}

fn expect_ok(reply: DebugReply, step: &str) -> Result<(), LinkError> {
    match reply {
        DebugReply::Ok => Ok(()),
        DebugReply::Refused { reason } => {
            Err(LinkError::Protocol(format!("{step} refused: {reason}")))
        }
        DebugReply::Error { message } => {
            Err(LinkError::Protocol(format!("{step} failed: {message}")))
        }
        other => Err(unexpected_reply(step, other)),
    }
}

fn unexpected_reply(step: &str, reply: DebugReply) -> LinkError {
    LinkError::Protocol(format!("unexpected {step} reply: {reply:?}"))
}

// ── Tests ────────────────────────────────────────────────────────
