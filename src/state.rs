use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::GatewayConfig;
use crate::emulator::EmulatorSupervisor;
use crate::ipc::{AudioSharedMemory, ControlSocket, VideoSharedMemory};
use crate::webrtc::PeerSessionManager;

/// Application-wide state shared across the HTTP and signaling handlers.
///
/// Everything conceptually process-wide (shared-memory handles, the
/// supervisor, the peer table) hangs off this one owned object built at
/// startup; signal handlers only flip the shutdown channel.
pub struct AppState {
    pub config: GatewayConfig,
    pub supervisor: Arc<EmulatorSupervisor>,
    pub control: Arc<ControlSocket>,
    pub video_shm: Arc<VideoSharedMemory>,
    pub audio_shm: Arc<AudioSharedMemory>,
    pub sessions: Arc<PeerSessionManager>,
    /// Set by the API or a data-channel PLI equivalent; consumed by the
    /// pipeline before the next encode
    pub keyframe_request: Arc<AtomicBool>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GatewayConfig,
        supervisor: Arc<EmulatorSupervisor>,
        control: Arc<ControlSocket>,
        video_shm: Arc<VideoSharedMemory>,
        audio_shm: Arc<AudioSharedMemory>,
        sessions: Arc<PeerSessionManager>,
        keyframe_request: Arc<AtomicBool>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            supervisor,
            control,
            video_shm,
            audio_shm,
            sessions,
            keyframe_request,
            shutdown_tx,
        })
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
