//! Runtime configuration
//!
//! Merges command-line arguments with environment overrides into one owned
//! configuration object built at startup. IPC names default to PID-suffixed
//! values so multiple gateways can coexist on one host.

use std::path::PathBuf;

/// Resolved gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HTTP server port for the browser client and JSON API
    pub http_port: u16,
    /// WebSocket signaling port
    pub signaling_port: u16,
    /// POSIX shared-memory name for the video region (leading slash)
    pub video_shm_name: String,
    /// POSIX shared-memory name for the audio ring (leading slash)
    pub audio_shm_name: String,
    /// Filesystem path of the control socket
    pub control_sock_path: PathBuf,
    /// Explicit emulator executable path, if given
    pub emulator_path: Option<PathBuf>,
    /// Emulator preferences file
    pub prefs_path: PathBuf,
    /// ROM directory
    pub roms_path: PathBuf,
    /// Disk image directory
    pub images_path: PathBuf,
    /// Spawn the emulator at startup
    pub auto_start: bool,
    /// Target encode frame rate
    pub fps: u32,
    /// Target encode bitrate in kbps
    pub bitrate_kbps: u32,
}

impl GatewayConfig {
    /// Build a config with PID-based IPC names, before CLI/env overrides
    pub fn with_defaults() -> Self {
        let pid = std::process::id();
        Self {
            http_port: 8000,
            signaling_port: 8090,
            video_shm_name: format!("/macemu-video-{}", pid),
            audio_shm_name: format!("/macemu-audio-{}", pid),
            control_sock_path: PathBuf::from(format!("/tmp/macemu-{}.sock", pid)),
            emulator_path: None,
            prefs_path: PathBuf::from("basilisk_ii.prefs"),
            roms_path: PathBuf::from("storage/roms"),
            images_path: PathBuf::from("storage/images"),
            auto_start: true,
            fps: 30,
            bitrate_kbps: 2000,
        }
    }

    /// Apply environment variable overrides (highest priority after CLI)
    pub fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("MACEMU_VIDEO_SHM") {
            self.video_shm_name = name;
        }
        if let Ok(name) = std::env::var("MACEMU_AUDIO_SHM") {
            self.audio_shm_name = name;
        }
        if let Ok(path) = std::env::var("MACEMU_CONTROL_SOCK") {
            self.control_sock_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BASILISK_ROMS") {
            self.roms_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BASILISK_IMAGES") {
            self.images_path = PathBuf::from(path);
        }
    }
}
