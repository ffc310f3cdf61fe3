use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use nix::sys::signal::{signal, SigHandler, Signal};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use macemu_gateway::config::GatewayConfig;
use macemu_gateway::emulator::EmulatorSupervisor;
use macemu_gateway::ipc::layout::AUDIO_FORMAT_S16LE;
use macemu_gateway::ipc::{AudioSharedMemory, ControlSocket, VideoSharedMemory};
use macemu_gateway::pipeline::Orchestrator;
use macemu_gateway::state::AppState;
use macemu_gateway::video::CodecKind;
use macemu_gateway::web;
use macemu_gateway::webrtc::{signaling, PeerSessionManager};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Video codec selection
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum CodecArg {
    #[default]
    Vp8,
    H264,
}

impl From<CodecArg> for CodecKind {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Vp8 => CodecKind::Vp8,
            CodecArg::H264 => CodecKind::H264,
        }
    }
}

/// macemu streaming gateway command line arguments
#[derive(Parser, Debug)]
#[command(name = "macemu-gateway")]
#[command(version, about = "WebRTC streaming gateway for BasiliskII/SheepShaver", long_about = None)]
struct CliArgs {
    /// HTTP server port
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// WebSocket signaling port
    #[arg(short = 's', long = "signaling", value_name = "PORT")]
    signaling_port: Option<u16>,

    /// Path to the BasiliskII/SheepShaver executable
    #[arg(short = 'e', long, value_name = "PATH")]
    emulator: Option<PathBuf>,

    /// Emulator prefs file
    #[arg(short = 'P', long, value_name = "FILE")]
    prefs: Option<PathBuf>,

    /// Video shared memory name (default: PID-based)
    #[arg(long, value_name = "NAME")]
    video_shm: Option<String>,

    /// Audio shared memory name (default: PID-based)
    #[arg(long, value_name = "NAME")]
    audio_shm: Option<String>,

    /// Control socket path (default: PID-based)
    #[arg(long, value_name = "PATH")]
    control_sock: Option<PathBuf>,

    /// ROMs directory
    #[arg(long, value_name = "DIR")]
    roms: Option<PathBuf>,

    /// Disk images directory
    #[arg(long, value_name = "DIR")]
    images: Option<PathBuf>,

    /// Don't auto-start the emulator (wait for the web UI)
    #[arg(short = 'n', long)]
    no_auto_start: bool,

    /// Video codec
    #[arg(long, value_name = "CODEC", default_value = "vp8")]
    codec: CodecArg,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level);

    // A peer closing its socket mid-send must not kill the process
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to ignore SIGPIPE")?;

    let mut config = GatewayConfig::with_defaults();
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(port) = args.signaling_port {
        config.signaling_port = port;
    }
    if let Some(path) = args.emulator {
        config.emulator_path = Some(path);
    }
    if let Some(path) = args.prefs {
        config.prefs_path = path;
    }
    if let Some(name) = args.video_shm {
        config.video_shm_name = name;
    }
    if let Some(name) = args.audio_shm {
        config.audio_shm_name = name;
    }
    if let Some(path) = args.control_sock {
        config.control_sock_path = path;
    }
    if let Some(path) = args.roms {
        config.roms_path = path;
    }
    if let Some(path) = args.images {
        config.images_path = path;
    }
    config.auto_start = !args.no_auto_start;
    config.apply_env();

    tracing::info!("Starting macemu-gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("HTTP port:      {}", config.http_port);
    tracing::info!("Signaling port: {}", config.signaling_port);
    tracing::info!("Video SHM:      {}", config.video_shm_name);
    tracing::info!("Control socket: {}", config.control_sock_path.display());
    tracing::info!("Prefs file:     {}", config.prefs_path.display());

    // IPC resources are owned by the gateway; creation failures are fatal
    let video_shm = Arc::new(
        VideoSharedMemory::create(&config.video_shm_name, 800, 600)
            .context("failed to create video shared memory")?,
    );
    video_shm.validate().context("video shared memory rejected")?;

    let audio_shm = Arc::new(
        AudioSharedMemory::create(&config.audio_shm_name, 44100, 2, AUDIO_FORMAT_S16LE)
            .context("failed to create audio shared memory")?,
    );
    audio_shm.validate().context("audio shared memory rejected")?;

    let control = Arc::new(
        ControlSocket::bind(&config.control_sock_path, video_shm.name(), audio_shm.name())
            .context("failed to create control socket")?,
    );

    let codec: CodecKind = args.codec.into();
    let keyframe_request = Arc::new(AtomicBool::new(false));
    let sessions = PeerSessionManager::new(codec, control.clone(), keyframe_request.clone());
    let supervisor = Arc::new(EmulatorSupervisor::new(&config));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = AppState::new(
        config.clone(),
        supervisor.clone(),
        control.clone(),
        video_shm.clone(),
        audio_shm.clone(),
        sessions.clone(),
        keyframe_request,
        shutdown_tx.clone(),
    );

    // HTTP server for the browser client and control API
    let http_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .with_context(|| format!("failed to bind HTTP port {}", config.http_port))?;
    let http_server = {
        let app = web::create_router(state.clone());
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(http_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                });
            if let Err(e) = serve.await {
                tracing::error!("HTTP server error: {}", e);
            }
        })
    };
    tracing::info!("HTTP server on port {}", config.http_port);

    // Signaling endpoint on its own port
    let signaling_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.signaling_port))
            .await
            .with_context(|| format!("failed to bind signaling port {}", config.signaling_port))?;
    let signaling_server = {
        let app = signaling::signaling_router(state.clone());
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let serve = axum::serve(signaling_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                });
            if let Err(e) = serve.await {
                tracing::error!("Signaling server error: {}", e);
            }
        })
    };
    tracing::info!("Signaling server on port {}", config.signaling_port);
    tracing::info!("Open http://localhost:{} in your browser", config.http_port);

    if config.auto_start {
        if let Err(e) = supervisor.start().await {
            tracing::warn!("{}; waiting for emulator to connect manually", e);
        }
    } else {
        tracing::info!("Auto-start disabled, waiting for emulator to connect");
    }

    // Main media pipeline
    let orchestrator = Orchestrator::new(state.clone(), codec);
    let running = orchestrator.running_flag();
    let pipeline = tokio::spawn(orchestrator.run());

    wait_for_shutdown().await;

    // Teardown order: pipeline, signaling peers, HTTP, emulator; shared
    // memory and the socket path are unlinked when their owners drop.
    running.store(false, std::sync::atomic::Ordering::Relaxed);
    let _ = pipeline.await;

    let _ = shutdown_tx.send(());
    sessions.close_all().await;
    let _ = signaling_server.await;
    let _ = http_server.await;

    supervisor.stop().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Block until SIGINT or SIGTERM
async fn wait_for_shutdown() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received terminate, shutting down");
        }
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Error => "macemu_gateway=error,tower_http=error",
        LogLevel::Warn => "macemu_gateway=warn,tower_http=warn",
        LogLevel::Info => "macemu_gateway=info,tower_http=info",
        LogLevel::Debug => "macemu_gateway=debug,tower_http=debug",
        LogLevel::Trace => "macemu_gateway=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
