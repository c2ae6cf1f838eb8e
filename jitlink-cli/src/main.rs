//! jitlink CLI — entry point.
//!
//! ```text
//! jitlink apps [--all | --hidden]      List installed apps
//! jitlink icon <bundle-id> [-o out]    Fetch an app icon as PNG
//! jitlink launch <bundle-id>           Launch without a debugger
//! jitlink heartbeat                    Run the keep-alive loop
//! jitlink syslog [--raw]               Stream device logs
//! jitlink attach --bundle-id <id>      Attach debugger, enable JIT
//! jitlink attach --pid <pid>           Attach to a running process
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use jitlink_core::{
    BundleId, DebugEvent, FilePairingSource, HeartbeatCode, PairingStore, SessionCoordinator,
    SyslogEvent, TcpTransport, syslog,
};

use config::CliConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "jitlink",
    about = "Drive a paired device: apps, icons, JIT debug, syslog"
)]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "jitlink.toml")]
    config: PathBuf,

    /// Bridge address (overrides config). Example: 192.168.1.30:27015
    #[arg(short, long)]
    bridge: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installed apps.
    Apps {
        /// Include visible system apps.
        #[arg(long)]
        all: bool,
        /// List hidden system apps instead.
        #[arg(long, conflicts_with = "all")]
        hidden: bool,
    },
    /// Fetch an app icon and write it as PNG.
    Icon {
        bundle_id: String,
        /// Output file.
        #[arg(short, long, default_value = "icon.png")]
        output: PathBuf,
    },
    /// Launch an app without attaching a debugger.
    Launch { bundle_id: String },
    /// Run the keep-alive heartbeat until interrupted.
    Heartbeat,
    /// Stream device logs until interrupted.
    Syslog {
        /// Print full lines instead of just the message part.
        #[arg(long)]
        raw: bool,
    },
    /// Attach a debugger and enable JIT for the target.
    Attach {
        /// Target bundle identifier (launches the app suspended).
        #[arg(long, conflicts_with = "pid")]
        bundle_id: Option<String>,
        /// Target pid (process must already be running).
        #[arg(long)]
        pid: Option<u32>,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", toml::to_string_pretty(&CliConfig::default())?);
        return Ok(());
    }

    let mut config = CliConfig::load(&cli.config);
    if let Some(addr) = cli.bridge {
        config.bridge.address = addr;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Some(command) = cli.command else {
        eprintln!("no command given; see `jitlink --help`");
        std::process::exit(2);
    };

    info!("jitlink v{}", env!("CARGO_PKG_VERSION"));

    let pairing = PairingStore::new(FilePairingSource::new(
        config
            .pairing
            .search_paths
            .iter()
            .map(PathBuf::from)
            .collect(),
    ));
    let transport = Arc::new(TcpTransport::new(config.bridge.address.clone()));
    let coordinator = SessionCoordinator::new(pairing, transport);

    let result = run(&coordinator, command).await;
    coordinator.shutdown().await;
    result
}

async fn run(
    coordinator: &SessionCoordinator,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Apps { all, hidden } => {
            let apps = if hidden {
                coordinator.list_hidden_system_apps().await?
            } else if all {
                coordinator.list_all_apps().await?
            } else {
                coordinator.list_user_apps().await?
            };
            for (bundle_id, name) in &apps {
                println!("{bundle_id}\t{name}");
            }
            info!(count = apps.len(), "catalog query complete");
        }

        Command::Icon { bundle_id, output } => {
            let icon = coordinator.app_icon(&BundleId::new(bundle_id)).await?;
            let image = image::RgbaImage::from_raw(icon.width, icon.height, icon.rgba)
                .ok_or("decoded icon buffer has the wrong size")?;
            image.save(&output)?;
            println!(
                "wrote {}x{} icon to {}",
                icon.width,
                icon.height,
                output.display()
            );
        }

        Command::Launch { bundle_id } => {
            coordinator
                .launch_without_debug(&BundleId::new(bundle_id))
                .await?;
            println!("launch requested");
        }

        Command::Heartbeat => {
            let events = coordinator.start_heartbeat().await?;
            let mut events = UnboundedReceiverStream::new(events);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        coordinator.stop_heartbeat().await;
                        break;
                    }
                    event = events.next() => match event {
                        Some(event) => {
                            println!("[{}] {}", event.code as i32, event.message);
                            if event.is_terminal() {
                                if event.code != HeartbeatCode::Stopped {
                                    return Err(event.message.into());
                                }
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        Command::Syslog { raw } => {
            let events = coordinator.start_syslog_relay().await?;
            let mut events = UnboundedReceiverStream::new(events);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        coordinator.stop_syslog_relay().await;
                        break;
                    }
                    event = events.next() => match event {
                        Some(SyslogEvent::Line(line)) => {
                            if raw {
                                println!("{line}");
                            } else {
                                println!("{}", syslog::message_part(&line));
                            }
                        }
                        Some(SyslogEvent::Error(e)) => {
                            error!("log stream ended: {e}");
                            return Err(e.into());
                        }
                        None => break,
                    }
                }
            }
        }

        Command::Attach { bundle_id, pid } => {
            let mut handle = match (bundle_id, pid) {
                (Some(bundle_id), None) => {
                    coordinator
                        .attach_debug_by_bundle_id(&BundleId::new(bundle_id))
                        .await?
                }
                (None, Some(pid)) => coordinator.attach_debug_by_pid(pid).await?,
                _ => return Err("specify exactly one of --bundle-id or --pid".into()),
            };
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        coordinator.detach_debug().await;
                        println!("detached");
                        break;
                    }
                    event = handle.next_event() => match event {
                        Some(DebugEvent::PhaseChanged(phase)) => info!(%phase, "debug session"),
                        Some(DebugEvent::Log(line)) => println!("{line}"),
                        Some(DebugEvent::Attached { pid }) => {
                            println!("attached to pid {pid}, JIT enabled");
                        }
                        Some(DebugEvent::Exited { status }) => {
                            println!("target exited with status {status}");
                            break;
                        }
                        Some(DebugEvent::Detached) => {
                            println!("detached");
                            break;
                        }
                        Some(DebugEvent::Failed(e)) => {
                            error!("debug session failed: {e}");
                            return Err(e.into());
                        }
                        None => break,
                    }
                }
            }
        }
    }

    Ok(())
}
