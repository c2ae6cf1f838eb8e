//! Integration tests — full coordinator scenarios against a scripted
//! in-memory device wired in through the transport seam.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jitlink_core::proto::apps::{AppKind, AppRecord, AppServiceReply, AppServiceRequest};
use jitlink_core::proto::debug::{DebugNotice, DebugReply, DebugRequest, ExecFlags};
use jitlink_core::proto::heartbeat::{Beat, BeatAck};
use jitlink_core::transport::{PipeChannel, pipe};
use jitlink_core::{
    BundleId, Channel, ChannelKind, Connection, DebugEvent, HeartbeatCode, HeartbeatConfig,
    LinkError, PairingCredential, PairingSource, PairingStore, SessionCoordinator, SyslogEvent,
    Transport,
};
use tokio::sync::Mutex;

// ── Fake device ──────────────────────────────────────────────────

/// Behavior and observable side effects of the scripted device.
struct DeviceState {
    apps: Vec<AppRecord>,
    icons: HashMap<String, Vec<u8>>,
    /// Bundles whose launch the daemon refuses.
    exclusive: HashSet<String>,
    /// Ack every Nth beat; 0 never acks.
    ack_every: u64,
    /// Chunks streamed on each syslog channel.
    syslog_chunks: Vec<Vec<u8>>,
    /// Output chunks streamed after a debug resume.
    debug_output: Vec<Vec<u8>>,
    /// Exit status sent after the output, if any.
    debug_exit: Option<i32>,
    /// Live pids.
    running: Mutex<HashSet<u32>>,
    /// Execution flags recorded per pid by the debug channel.
    exec_flags: Mutex<HashMap<u32, u32>>,
    next_pid: AtomicU32,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            apps: vec![
                record("com.a.App", "App", AppKind::User),
                record("com.apple.Files", "Files", AppKind::System),
                record("com.apple.Diagnostics", "Diagnostics", AppKind::HiddenSystem),
            ],
            icons: HashMap::new(),
            exclusive: HashSet::new(),
            ack_every: 1,
            syslog_chunks: Vec::new(),
            debug_output: Vec::new(),
            debug_exit: None,
            running: Mutex::new(HashSet::new()),
            exec_flags: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1000),
        }
    }
}

fn record(bundle_id: &str, name: &str, kind: AppKind) -> AppRecord {
    AppRecord {
        bundle_id: bundle_id.into(),
        display_name: name.into(),
        kind,
    }
}

fn sample_png() -> Vec<u8> {
    let pixels = image::RgbaImage::from_pixel(8, 8, image::Rgba([1, 2, 3, 255]));
    let mut encoded = Vec::new();
    image::DynamicImage::ImageRgba8(pixels)
        .write_to(&mut Cursor::new(&mut encoded), image::ImageFormat::Png)
        .expect("png encoding");
    encoded
}

struct FakeDevice {
    state: Arc<DeviceState>,
}

#[async_trait]
impl Transport for FakeDevice {
    async fn open(&self, _credential: &PairingCredential) -> Result<Box<dyn Connection>, LinkError> {
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
        }))
    }
}

struct FakeConnection {
    state: Arc<DeviceState>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn open_channel(&self, kind: ChannelKind) -> Result<Box<dyn Channel>, LinkError> {
        let (client, device) = pipe(64);
        let state = self.state.clone();
        match kind {
            ChannelKind::Heartbeat => {
                tokio::spawn(heartbeat_device(device, state));
            }
            ChannelKind::AppService => {
                tokio::spawn(app_service_device(device, state));
            }
            ChannelKind::Debug => {
                tokio::spawn(debug_device(device, state));
            }
            ChannelKind::Syslog => {
                tokio::spawn(syslog_device(device, state));
            }
        }
        Ok(Box::new(client))
    }
}

async fn heartbeat_device(mut channel: PipeChannel, state: Arc<DeviceState>) {
    let mut beats: u64 = 0;
    while let Ok(Some(frame)) = channel.receive().await {
        let Ok(beat) = Beat::from_bytes(&frame) else {
            break;
        };
        beats += 1;
        if state.ack_every > 0 && beats % state.ack_every == 0 {
            let ack = BeatAck {
                sequence: beat.sequence,
            };
            if channel.send(ack.to_bytes().unwrap().into()).await.is_err() {
                break;
            }
        }
    }
}

async fn app_service_device(mut channel: PipeChannel, state: Arc<DeviceState>) {
    while let Ok(Some(frame)) = channel.receive().await {
        let Ok(request) = AppServiceRequest::from_bytes(&frame) else {
            break;
        };
        let reply = match request {
            AppServiceRequest::ListApps { scope } => AppServiceReply::Apps {
                apps: state
                    .apps
                    .iter()
                    .filter(|app| scope.includes(app.kind))
                    .cloned()
                    .collect(),
            },
            AppServiceRequest::FetchIcon { bundle_id } => {
                if !state.apps.iter().any(|app| app.bundle_id == bundle_id) {
                    AppServiceReply::UnknownBundle { bundle_id }
                } else if let Some(data) = state.icons.get(&bundle_id) {
                    AppServiceReply::Icon {
                        bundle_id,
                        data: data.clone(),
                    }
                } else {
                    AppServiceReply::NoIcon { bundle_id }
                }
            }
            AppServiceRequest::Launch { bundle_id } => {
                if !state.apps.iter().any(|app| app.bundle_id == bundle_id) {
                    AppServiceReply::UnknownBundle { bundle_id }
                } else if state.exclusive.contains(&bundle_id) {
                    AppServiceReply::LaunchRefused {
                        bundle_id,
                        reason: "app is already running exclusively".into(),
                    }
                } else {
                    let pid = state.next_pid.fetch_add(1, Ordering::SeqCst);
                    state.running.lock().await.insert(pid);
                    AppServiceReply::Launched { bundle_id, pid }
                }
            }
        };
        if channel.send(reply.to_bytes().unwrap().into()).await.is_err() {
            break;
        }
    }
}

async fn debug_device(mut channel: PipeChannel, state: Arc<DeviceState>) {
    let mut attached: Option<u32> = None;
    let mut flags_set = false;

    while let Ok(Some(frame)) = channel.receive().await {
        let Ok(request) = DebugRequest::from_bytes(&frame) else {
            break;
        };
        let is_resume = matches!(request, DebugRequest::Resume { .. });
        let reply = match request {
            DebugRequest::LaunchSuspended { bundle_id } => {
                if !state.apps.iter().any(|app| app.bundle_id == bundle_id) {
                    DebugReply::UnknownBundle { bundle_id }
                } else {
                    let pid = state.next_pid.fetch_add(1, Ordering::SeqCst);
                    state.running.lock().await.insert(pid);
                    DebugReply::Launched { pid }
                }
            }
            DebugRequest::VerifyPid { pid } => {
                if state.running.lock().await.contains(&pid) {
                    DebugReply::Ok
                } else {
                    DebugReply::UnknownPid { pid }
                }
            }
            DebugRequest::Attach { pid } => {
                attached = Some(pid);
                DebugReply::Ok
            }
            DebugRequest::SetExecFlags { pid, flags } => {
                if attached != Some(pid) {
                    DebugReply::Error {
                        message: "flags before attach".into(),
                    }
                } else {
                    state.exec_flags.lock().await.insert(pid, flags);
                    flags_set = true;
                    DebugReply::Ok
                }
            }
            DebugRequest::Resume { pid } => {
                if attached != Some(pid) || !flags_set {
                    DebugReply::Error {
                        message: "resume before setup complete".into(),
                    }
                } else {
                    DebugReply::Ok
                }
            }
            DebugRequest::Detach => {
                let _ = channel.send(DebugReply::Ok.to_bytes().unwrap().into()).await;
                break;
            }
        };

        let resumed = is_resume && matches!(&reply, DebugReply::Ok);
        if channel.send(reply.to_bytes().unwrap().into()).await.is_err() {
            break;
        }

        if resumed {
            for chunk in &state.debug_output {
                let notice = DebugNotice::Output {
                    data: chunk.clone(),
                };
                if channel
                    .send(notice.to_bytes().unwrap().into())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if let Some(status) = state.debug_exit {
                let _ = channel
                    .send(DebugNotice::Exited { status }.to_bytes().unwrap().into())
                    .await;
                return;
            }
        }
    }
}

async fn syslog_device(mut channel: PipeChannel, state: Arc<DeviceState>) {
    for chunk in &state.syslog_chunks {
        if channel
            .send(bytes::Bytes::copy_from_slice(chunk))
            .await
            .is_err()
        {
            return;
        }
    }
    // Keep the stream open until the relay goes away.
    while let Ok(Some(_)) = channel.receive().await {}
}

// ── Coordinator wiring ───────────────────────────────────────────

struct StaticPairing(Vec<u8>);

#[async_trait]
impl PairingSource for StaticPairing {
    async fn locate(&self) -> Result<Option<Vec<u8>>, LinkError> {
        Ok(Some(self.0.clone()))
    }
}

fn coordinator_for(state: DeviceState) -> (Arc<DeviceState>, SessionCoordinator) {
    let state = Arc::new(state);
    let credential = PairingCredential::seal("0000-TEST-UDID", "HOST-TEST", b"record".to_vec());
    let pairing = PairingStore::new(StaticPairing(credential.to_json().unwrap()));
    let coordinator = SessionCoordinator::new(
        pairing,
        Arc::new(FakeDevice {
            state: state.clone(),
        }),
    )
    .with_heartbeat_config(HeartbeatConfig {
        interval: Duration::from_millis(20),
        ack_timeout: Duration::from_millis(15),
        miss_tolerance: 3,
    });
    (state, coordinator)
}

async fn wait_attached(handle: &mut jitlink_core::DebugHandle) -> u32 {
    loop {
        match handle.next_event().await.expect("session event stream") {
            DebugEvent::Attached { pid } => return pid,
            DebugEvent::Failed(e) => panic!("attach failed: {e}"),
            _ => {}
        }
    }
}

async fn wait_failed(handle: &mut jitlink_core::DebugHandle) -> LinkError {
    loop {
        match handle.next_event().await.expect("session event stream") {
            DebugEvent::Failed(e) => return e,
            DebugEvent::Attached { .. } => panic!("attach unexpectedly succeeded"),
            _ => {}
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[tokio::test]
async fn user_listing_is_exact_and_all_is_a_superset() {
    let (_, coordinator) = coordinator_for(DeviceState::default());

    let user = coordinator.list_user_apps().await.unwrap();
    assert_eq!(user.len(), 1);
    assert_eq!(
        user.get(&BundleId::new("com.a.App")).map(String::as_str),
        Some("App")
    );

    let all = coordinator.list_all_apps().await.unwrap();
    assert!(all.len() > user.len());
    for bundle_id in user.keys() {
        assert!(all.contains_key(bundle_id));
    }
    assert!(all.contains_key(&BundleId::new("com.apple.Files")));

    let hidden = coordinator.list_hidden_system_apps().await.unwrap();
    assert_eq!(hidden.len(), 1);
    assert!(hidden.contains_key(&BundleId::new("com.apple.Diagnostics")));

    coordinator.shutdown().await;
}

// ── Icons ────────────────────────────────────────────────────────

#[tokio::test]
async fn every_cataloged_app_yields_icon_or_unavailable() {
    let mut state = DeviceState::default();
    state.icons.insert("com.a.App".into(), sample_png());
    let (_, coordinator) = coordinator_for(state);

    let mut all = coordinator.list_all_apps().await.unwrap();
    all.extend(coordinator.list_hidden_system_apps().await.unwrap());

    for bundle_id in all.keys() {
        match coordinator.app_icon(bundle_id).await {
            Ok(icon) => {
                assert!(icon.width > 0 && icon.height > 0);
                assert!(!icon.rgba.is_empty());
            }
            Err(LinkError::IconUnavailable(_)) => {}
            Err(other) => panic!("unexpected icon error for {bundle_id}: {other}"),
        }
    }

    coordinator.shutdown().await;
}

#[tokio::test]
async fn icon_for_unknown_bundle_is_app_not_found() {
    let (_, coordinator) = coordinator_for(DeviceState::default());
    assert!(matches!(
        coordinator.app_icon(&BundleId::new("com.not.Installed")).await,
        Err(LinkError::AppNotFound(_))
    ));
}

// ── Launch ───────────────────────────────────────────────────────

#[tokio::test]
async fn launch_succeeds_for_installed_app() {
    let (state, coordinator) = coordinator_for(DeviceState::default());
    coordinator
        .launch_without_debug(&BundleId::new("com.a.App"))
        .await
        .unwrap();
    assert!(!state.running.lock().await.is_empty());
}

#[tokio::test]
async fn exclusive_app_launch_is_refused_with_reason() {
    let mut state = DeviceState::default();
    state.exclusive.insert("com.a.App".into());
    let (_, coordinator) = coordinator_for(state);

    match coordinator
        .launch_without_debug(&BundleId::new("com.a.App"))
        .await
    {
        Err(LinkError::LaunchRefused { bundle_id, reason }) => {
            assert_eq!(bundle_id, "com.a.App");
            assert!(reason.contains("exclusively"));
        }
        other => panic!("unexpected launch outcome: {other:?}"),
    }
}

#[tokio::test]
async fn launching_unknown_bundle_is_app_not_found() {
    let (_, coordinator) = coordinator_for(DeviceState::default());
    assert!(matches!(
        coordinator
            .launch_without_debug(&BundleId::new("com.not.Installed"))
            .await,
        Err(LinkError::AppNotFound(_))
    ));
}

// ── Heartbeat ────────────────────────────────────────────────────

#[tokio::test]
async fn lossy_acks_within_tolerance_keep_the_loop_alive() {
    let mut state = DeviceState::default();
    state.ack_every = 2;
    let (_, coordinator) = coordinator_for(state);

    let mut events = coordinator.start_heartbeat().await.unwrap();
    let mut progress = 0;
    while progress < 6 {
        let event = events.recv().await.unwrap();
        assert_eq!(
            event.code,
            HeartbeatCode::Progress,
            "loop must not fail while acks keep resuming: {}",
            event.message
        );
        progress += 1;
    }
    assert!(coordinator.heartbeat_state().is_running());

    coordinator.stop_heartbeat().await;
    let terminal: Vec<_> = drain(events).into_iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].code, HeartbeatCode::Stopped);
}

#[tokio::test]
async fn sustained_silence_fails_exactly_once() {
    let mut state = DeviceState::default();
    state.ack_every = 0;
    let (_, coordinator) = coordinator_for(state);

    let mut events = coordinator.start_heartbeat().await.unwrap();
    let mut terminal = Vec::new();
    while let Some(event) = events.recv().await {
        if event.is_terminal() {
            terminal.push(event);
        }
    }
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].code, HeartbeatCode::SilenceExceeded);

    let health = coordinator.connection_health().await;
    assert!(matches!(
        health.heartbeat,
        jitlink_core::HeartbeatState::Failed(_)
    ));
    // The heartbeat failure is isolated: the link itself is still up
    // and one-shot operations keep working.
    assert!(health.connected);
    assert!(coordinator.list_user_apps().await.is_ok());
}

// ── Syslog relay ─────────────────────────────────────────────────

#[tokio::test]
async fn split_chunks_deliver_exact_lines_in_order() {
    let mut state = DeviceState::default();
    state.syslog_chunks = vec![b"line1\nline2\nli".to_vec(), b"ne3\n".to_vec()];
    let (_, coordinator) = coordinator_for(state);

    let mut events = coordinator.start_syslog_relay().await.unwrap();
    for expected in ["line1", "line2", "line3"] {
        match events.recv().await.unwrap() {
            SyslogEvent::Line(line) => assert_eq!(line, expected),
            SyslogEvent::Error(e) => panic!("unexpected relay error: {e}"),
        }
    }

    coordinator.stop_syslog_relay().await;
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn stop_relay_twice_is_a_no_op() {
    let mut state = DeviceState::default();
    state.syslog_chunks = vec![b"only\n".to_vec()];
    let (_, coordinator) = coordinator_for(state);

    let mut events = coordinator.start_syslog_relay().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        SyslogEvent::Line(_)
    ));

    coordinator.stop_syslog_relay().await;
    coordinator.stop_syslog_relay().await;
    assert_eq!(coordinator.syslog_state(), jitlink_core::RelayState::Stopped);
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn restart_produces_a_single_fresh_stream() {
    let mut state = DeviceState::default();
    state.syslog_chunks = vec![b"alpha\n".to_vec()];
    let (_, coordinator) = coordinator_for(state);

    let mut first = coordinator.start_syslog_relay().await.unwrap();
    let mut second = coordinator.start_syslog_relay().await.unwrap();

    // The first subscription ends when the relay restarts.
    while let Some(event) = first.recv().await {
        assert!(matches!(event, SyslogEvent::Line(_)));
    }

    match second.recv().await.unwrap() {
        SyslogEvent::Line(line) => assert_eq!(line, "alpha"),
        SyslogEvent::Error(e) => panic!("unexpected relay error: {e}"),
    }

    coordinator.stop_syslog_relay().await;
}

// ── Debug sessions ───────────────────────────────────────────────

#[tokio::test]
async fn bundle_attach_walks_the_machine_and_streams_output() {
    let mut state = DeviceState::default();
    state.debug_output = vec![b"jit ready\npartial".to_vec(), b" line\n".to_vec()];
    let (state, coordinator) = coordinator_for(state);

    let mut handle = coordinator
        .attach_debug_by_bundle_id(&BundleId::new("com.a.App"))
        .await
        .unwrap();

    let pid = wait_attached(&mut handle).await;
    assert!(coordinator.debug_phase().is_attached());
    assert_eq!(
        state.exec_flags.lock().await.get(&pid),
        Some(&ExecFlags::jit().bits())
    );

    // Output lines arrive in production order.
    let mut lines = Vec::new();
    while lines.len() < 2 {
        match handle.next_event().await.unwrap() {
            DebugEvent::Log(line) => lines.push(line),
            DebugEvent::Failed(e) => panic!("session failed: {e}"),
            _ => {}
        }
    }
    assert_eq!(lines, vec!["jit ready", "partial line"]);

    coordinator.detach_debug().await;
    assert_eq!(coordinator.debug_phase(), jitlink_core::DebugPhase::Detached);

    // Only events produced before detach returned remain buffered.
    let mut saw_detached = false;
    while let Some(event) = handle.next_event().await {
        if matches!(event, DebugEvent::Detached) {
            saw_detached = true;
        }
    }
    assert!(saw_detached);
}

#[tokio::test]
async fn second_attach_is_busy_and_leaves_the_first_untouched() {
    let (_, coordinator) = coordinator_for(DeviceState::default());

    let mut handle = coordinator
        .attach_debug_by_bundle_id(&BundleId::new("com.a.App"))
        .await
        .unwrap();
    wait_attached(&mut handle).await;

    assert!(matches!(
        coordinator
            .attach_debug_by_bundle_id(&BundleId::new("com.apple.Files"))
            .await,
        Err(LinkError::SessionBusy)
    ));
    assert!(coordinator.debug_phase().is_attached());

    coordinator.detach_debug().await;
}

#[tokio::test]
async fn bundle_and_pid_attach_converge_to_the_same_configuration() {
    let (state, coordinator) = coordinator_for(DeviceState::default());

    let mut handle = coordinator
        .attach_debug_by_bundle_id(&BundleId::new("com.a.App"))
        .await
        .unwrap();
    let pid = wait_attached(&mut handle).await;
    let by_bundle = *state.exec_flags.lock().await.get(&pid).unwrap();
    coordinator.detach_debug().await;

    let mut handle = coordinator.attach_debug_by_pid(pid).await.unwrap();
    let pid_again = wait_attached(&mut handle).await;
    assert_eq!(pid_again, pid);
    assert!(coordinator.debug_phase().is_attached());

    let by_pid = *state.exec_flags.lock().await.get(&pid).unwrap();
    assert_eq!(by_bundle, by_pid);
    assert_eq!(by_pid, ExecFlags::jit().bits());

    coordinator.detach_debug().await;
}

#[tokio::test]
async fn attach_to_unknown_bundle_fails_with_app_not_found() {
    let (_, coordinator) = coordinator_for(DeviceState::default());

    let mut handle = coordinator
        .attach_debug_by_bundle_id(&BundleId::new("com.not.Installed"))
        .await
        .unwrap();
    let error = wait_failed(&mut handle).await;
    assert!(matches!(error, LinkError::AppNotFound(_)));
    assert_eq!(coordinator.debug_phase(), jitlink_core::DebugPhase::Failed);

    // The slot is free again after a failed attach.
    let mut handle = coordinator
        .attach_debug_by_bundle_id(&BundleId::new("com.a.App"))
        .await
        .unwrap();
    wait_attached(&mut handle).await;
    coordinator.detach_debug().await;
}

#[tokio::test]
async fn attach_to_dead_pid_fails() {
    let (_, coordinator) = coordinator_for(DeviceState::default());

    let mut handle = coordinator.attach_debug_by_pid(31337).await.unwrap();
    let error = wait_failed(&mut handle).await;
    assert!(matches!(error, LinkError::ProcessNotFound(31337)));
}

#[tokio::test]
async fn target_exit_detaches_cleanly() {
    let mut state = DeviceState::default();
    state.debug_output = vec![b"goodbye\n".to_vec()];
    state.debug_exit = Some(0);
    let (_, coordinator) = coordinator_for(state);

    let mut handle = coordinator
        .attach_debug_by_bundle_id(&BundleId::new("com.a.App"))
        .await
        .unwrap();
    wait_attached(&mut handle).await;

    let mut exited = None;
    while let Some(event) = handle.next_event().await {
        if let DebugEvent::Exited { status } = event {
            exited = Some(status);
        }
    }
    assert_eq!(exited, Some(0));
    assert_eq!(coordinator.debug_phase(), jitlink_core::DebugPhase::Detached);
}

// ── Teardown ─────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_cancels_every_session() {
    let mut state = DeviceState::default();
    state.syslog_chunks = vec![b"noise\n".to_vec()];
    let (_, coordinator) = coordinator_for(state);

    let _heartbeat = coordinator.start_heartbeat().await.unwrap();
    let _syslog = coordinator.start_syslog_relay().await.unwrap();
    let mut handle = coordinator
        .attach_debug_by_bundle_id(&BundleId::new("com.a.App"))
        .await
        .unwrap();
    wait_attached(&mut handle).await;

    coordinator.shutdown().await;

    let health = coordinator.connection_health().await;
    assert!(!health.connected);
    assert_eq!(health.heartbeat, jitlink_core::HeartbeatState::Idle);
    assert_eq!(health.syslog, jitlink_core::RelayState::Stopped);
    assert_eq!(health.debug, jitlink_core::DebugPhase::Detached);
}

// ── Helpers ──────────────────────────────────────────────────────

fn drain<T>(mut rx: tokio::sync::mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}
