//! Tandem RTC CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tandem_rtc_core::prelude::*;
use tandem_rtc_core::DeviceManager;
use tracing_subscriber::EnvFilter;

mod demo;

use demo::{answer_calls, describe, print_events, wait_for, DemoRoom};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Participant identity (e.g., "lunar-orbit")
    #[arg(short, long, env = "TANDEM_IDENTITY")]
    identity: Option<String>,

    /// JSON config file (defaults to the platform config directory)
    #[arg(short, long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a mesh room in-process
    Room {
        /// Other members to join alongside this identity
        #[arg(long, value_delimiter = ',', default_value = "alice,bob")]
        members: Vec<String>,

        /// Capture video as well as audio
        #[arg(long)]
        video: bool,

        /// Seconds to wait for the mesh to connect
        #[arg(long, default_value = "10")]
        wait: u64,
    },

    /// Simulate a 1:1 call in-process
    Call {
        /// Simulated callee
        #[arg(default_value = "bob")]
        callee: String,

        /// Let the invite ring out instead of answering
        #[arg(long)]
        no_answer: bool,

        /// Video call
        #[arg(long)]
        video: bool,

        /// Override the ring timeout, in seconds
        #[arg(long)]
        ring_timeout: Option<u64>,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "3")]
        duration: u64,
    },

    /// Join a room through a QUIC signaling relay
    Listen {
        /// Relay address
        relay: SocketAddr,

        /// Local bind address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Auto-accept incoming calls
        #[arg(long)]
        auto_accept: bool,
    },

    /// List capture and playback devices
    Devices,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tandem=info")),
        )
        .init();

    let cli = Cli::parse();

    let identity = cli.identity.unwrap_or_else(generate_random_identity);
    let config_path = cli.config.or_else(default_config_path);
    let config = load_config(config_path.as_deref())?;

    println!("🔗 Using identity: {}", identity);

    match cli.command {
        Commands::Room {
            members,
            video,
            wait,
        } => {
            handle_room(&identity, &members, video, wait, config).await?;
        }
        Commands::Call {
            callee,
            no_answer,
            video,
            ring_timeout,
            duration,
        } => {
            let mut config = config;
            if let Some(secs) = ring_timeout {
                config.ring_timeout_secs = secs;
            }
            handle_call(&identity, &callee, !no_answer, video, duration, config).await?;
        }
        Commands::Listen {
            relay,
            bind,
            auto_accept,
        } => {
            handle_listen(&identity, relay, bind, auto_accept, config).await?;
        }
        Commands::Devices => {
            handle_devices().await?;
        }
        Commands::Config => {
            handle_config(config_path.as_deref(), &config)?;
        }
    }

    Ok(())
}

async fn handle_room(
    identity: &str,
    members: &[String],
    video: bool,
    wait: u64,
    config: OrchestratorConfig,
) -> Result<()> {
    let others: Vec<&String> = members.iter().filter(|m| *m != identity).collect();
    println!("🏠 Simulating room with {} other member(s)", others.len());

    let mut room = DemoRoom::new(config);
    let local = room.join(identity).await?;
    let printer = print_events(identity.to_string(), &local);
    local.start_capture(true, video).await?;

    for member in &others {
        let handle = room.join(member).await?;
        handle.start_capture(true, video).await?;
    }

    let expected = others.len();
    let outcome = wait_for(&local, Duration::from_secs(wait), |s| {
        s.sessions
            .iter()
            .filter(|info| info.state == SessionState::Connected)
            .count()
            == expected
    })
    .await;

    let snapshot = local.snapshot().await?;
    match outcome {
        Ok(_) => println!("✅ Mesh connected ({} offers sent)", room.offers()),
        Err(e) => println!("⚠️  Mesh incomplete: {}", e),
    }
    for session in &snapshot.sessions {
        println!(
            "   {} {:?} as {:?} (epoch {})",
            session.remote, session.state, session.role, session.epoch
        );
    }

    room.close().await;
    printer.abort();
    Ok(())
}

async fn handle_call(
    identity: &str,
    callee: &str,
    answer: bool,
    video: bool,
    duration: u64,
    config: OrchestratorConfig,
) -> Result<()> {
    let kind = if video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };
    let ring_limit = Duration::from_secs(config.ring_timeout_secs + 5);

    let mut room = DemoRoom::new(config);
    let caller = room.join(identity).await?;
    let remote = room.join(callee).await?;
    let printer = print_events(identity.to_string(), &caller);
    let answering = answer_calls(remote, answer);

    let callee_id = ParticipantId::new(callee);
    wait_for(&caller, Duration::from_secs(5), |s| s.online.contains(&callee_id))
        .await
        .context("callee never came online")?;

    println!("📞 Calling {}...", callee);
    let call_id = caller.invite(&callee_id, kind).await?;
    println!("   Call ID: {}", call_id);

    let snapshot = wait_for(&caller, ring_limit, |s| {
        matches!(s.call_state(), CallState::Connected | CallState::Idle)
    })
    .await?;

    if snapshot.call_state() == CallState::Connected {
        println!("✅ Connected; hanging up in {}s", duration);
        tokio::time::sleep(Duration::from_secs(duration)).await;
        caller.hang_up().await?;
    }

    let snapshot = caller.snapshot().await?;
    if let Some(call) = snapshot.last_call {
        let length = call
            .duration()
            .map_or_else(|| "-".to_string(), |d| format!("{}s", d.num_seconds()));
        println!(
            "📞 Call ended: {:?} (duration {})",
            call.end_reason, length
        );
    }

    room.close().await;
    answering.abort();
    printer.abort();
    Ok(())
}

async fn handle_listen(
    identity: &str,
    relay: SocketAddr,
    bind: Option<SocketAddr>,
    auto_accept: bool,
    config: OrchestratorConfig,
) -> Result<()> {
    println!("👂 Joining room via relay {}...", relay);

    let mut channel = QuicSignalingChannel::new(TransportConfig { local_addr: bind });
    channel.start().await?;
    channel.connect_to_relay(relay).await?;
    println!("✅ Connected from {}", channel.local_addr()?);

    let links = RtcLinkFactory::from_config(&config);
    let handle = Orchestrator::builder(
        ParticipantId::new(identity),
        Arc::new(channel),
        Arc::new(links),
    )
    .with_config(config)
    .build()
    .await?;
    handle.start_capture(true, true).await?;

    let mut events = handle.subscribe_events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("👋 Leaving room");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("   {}", describe(&event));
                    if auto_accept
                        && matches!(
                            event,
                            OrchestratorEvent::CallStateChanged {
                                state: CallState::IncomingRinging,
                                ..
                            }
                        )
                    {
                        println!("✅ Accepting call...");
                        if let Err(e) = handle.accept().await {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn handle_devices() -> Result<()> {
    let mut manager = DeviceManager::new(Arc::new(StaticDeviceBackend::with_defaults()));
    for notice in manager.refresh().await? {
        println!("⚠️  {:?}", notice);
    }

    let list = manager.list_devices();
    let selection = manager.selection();
    println!("🎛️  Devices");
    println!("==========");
    for (title, devices, selected) in [
        ("Microphones", &list.audio_inputs, &selection.audio_input),
        ("Cameras", &list.video_inputs, &selection.video_input),
        ("Speakers", &list.audio_outputs, &selection.audio_output),
    ] {
        println!("{}:", title);
        for device in devices {
            let marker = if selected.as_ref() == Some(&device.id) {
                "*"
            } else {
                " "
            };
            println!("  {} {} ({})", marker, device.label, device.id);
        }
    }
    Ok(())
}

fn handle_config(path: Option<&Path>, config: &OrchestratorConfig) -> Result<()> {
    match path {
        Some(path) if path.exists() => println!("📄 Config file: {}", path.display()),
        Some(path) => println!("📄 Config file: {} (not found, using defaults)", path.display()),
        None => println!("📄 No config directory; using defaults"),
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "tandem", "tandem-rtc")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

/// Load the config file if present, defaults otherwise
fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    match path {
        Some(path) if path.exists() => OrchestratorConfig::from_json_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        _ => Ok(OrchestratorConfig::default()),
    }
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "amber", "birch", "cedar", "delta", "ember", "fjord", "grove", "harbor", "island",
        "juniper", "kestrel", "lagoon", "meadow", "nectar", "orbit", "pebble", "quartz", "river",
        "summit", "tundra", "umber", "valley", "willow", "yarrow", "zephyr", "lunar", "comet",
        "falcon", "heron", "maple",
    ];

    let mut rng = rand::thread_rng();
    let words: Vec<&str> = WORDS.choose_multiple(&mut rng, 2).copied().collect();
    words.join("-")
}
