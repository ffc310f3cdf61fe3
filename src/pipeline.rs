//! Pipeline orchestrator
//!
//! The single main loop of the gateway. Each tick: supervise the emulator
//! (every 500 ms), service the control socket, wait for a new shared-memory
//! frame, then convert, encode, packetize, and fan the packets out to every
//! ready peer. No other component reads shared memory, and no lock is held
//! across an encode call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ipc::EmulatorMessage;
use crate::state::AppState;
use crate::video::{create_encoder, CodecKind, EncoderSettings, PixelFormat, VideoEncoder};
use crate::webrtc::RtpPacketizer;

/// Supervisor cadence
const SUPERVISOR_INTERVAL: Duration = Duration::from_millis(500);
/// Sleep while the shared region is unpublished
const UNPUBLISHED_SLEEP: Duration = Duration::from_millis(100);
/// Sleep while no new frame has been produced
const IDLE_SLEEP: Duration = Duration::from_millis(5);
/// Stats emission cadence
const STATS_INTERVAL: Duration = Duration::from_secs(3);

pub struct Orchestrator {
    state: Arc<AppState>,
    encoder: Box<dyn VideoEncoder>,
    packetizer: RtpPacketizer,
    running: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(state: Arc<AppState>, codec: CodecKind) -> Self {
        let settings = EncoderSettings {
            fps: state.config.fps,
            bitrate_kbps: state.config.bitrate_kbps,
        };
        let encoder = create_encoder(codec, settings);
        let packetizer = RtpPacketizer::new(codec, std::process::id(), state.config.fps);

        Self {
            state,
            encoder,
            packetizer,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flag the main loop polls; flip to stop
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub async fn run(mut self) {
        tracing::info!("Starting frame processing loop ({})", self.encoder.codec());

        let mut last_frame_count = 0u64;
        let mut last_supervisor_check = Instant::now() - SUPERVISOR_INTERVAL;
        let mut last_stats = Instant::now();
        let mut frames_encoded = 0u32;

        while self.running.load(Ordering::Relaxed) {
            // Supervisor status and queued restart requests
            if last_supervisor_check.elapsed() >= SUPERVISOR_INTERVAL {
                last_supervisor_check = Instant::now();
                self.state.supervisor.tick(self.state.config.auto_start).await;
                self.state.sessions.sweep().await;
            }

            // Control socket: accept a waiting emulator, or service the
            // live connection (which also detects peer closure)
            if !self.state.control.is_connected() {
                self.state.control.try_accept().await;
            } else {
                for msg in self.state.control.poll_inbound().await {
                    handle_emulator_message(&msg);
                }
                if !self.state.control.is_connected() {
                    last_frame_count = 0;
                }
            }

            if !self.state.video_shm.is_published() {
                tokio::time::sleep(UNPUBLISHED_SLEEP).await;
                continue;
            }

            let frame_count = self.state.video_shm.frame_count();
            if frame_count == last_frame_count {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }
            last_frame_count = frame_count;

            let Some(view) = self.state.video_shm.read_current() else {
                continue;
            };

            if self.state.keyframe_request.swap(false, Ordering::AcqRel) {
                self.encoder.request_keyframe();
            }

            let format = PixelFormat::from_tag(view.format);
            let bitstream = match self.encoder.encode(
                view.data,
                view.width,
                view.height,
                view.stride,
                format,
            ) {
                Ok(bitstream) => bitstream,
                Err(e) => {
                    tracing::debug!("Encode failed, skipping frame: {}", e);
                    continue;
                }
            };
            if bitstream.is_empty() {
                tracing::debug!("Empty bitstream, skipping frame");
                continue;
            }

            let is_keyframe = self.encoder.is_keyframe(&bitstream);
            let packets = self.packetizer.packetize(&bitstream);
            self.state.sessions.fan_out(&packets).await;

            frames_encoded += 1;
            tracing::trace!(
                "Frame {}: {} bytes, {} packets, keyframe={}",
                frame_count,
                bitstream.len(),
                packets.len(),
                is_keyframe
            );

            if last_stats.elapsed() >= STATS_INTERVAL {
                let fps = frames_encoded as f32 * 1000.0 / last_stats.elapsed().as_millis() as f32;
                let peers = self.state.sessions.peer_count().await;
                let emu = if self.state.supervisor.is_running() {
                    "running"
                } else {
                    "stopped"
                };
                tracing::info!("fps={:.1} peers={} emu={}", fps, peers, emu);
                frames_encoded = 0;
                last_stats = Instant::now();
            }
        }

        tracing::info!("Frame processing loop exited");
    }
}

fn handle_emulator_message(msg: &EmulatorMessage) {
    match msg {
        EmulatorMessage::Status { running, fps } => {
            tracing::debug!("Emulator status: running={} fps={}", running, fps);
        }
        EmulatorMessage::Error { message } => {
            tracing::warn!("Emulator error: {}", message);
        }
        EmulatorMessage::Config { .. } => tracing::debug!("Emulator sent config data"),
        EmulatorMessage::Storage { .. } => tracing::debug!("Emulator sent storage data"),
        EmulatorMessage::Ack => tracing::trace!("Emulator ack"),
    }
}
