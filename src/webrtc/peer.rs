//! Peer session
//!
//! One browser peer: the peer connection, exactly one outbound video track,
//! the server-created `input` data channel, readiness flags, and the queue
//! of ICE candidates that arrived before the remote description. Callbacks
//! capture only small cloned handles (flags, the session id, the control
//! socket), never the session itself, so teardown stays deterministic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::error::{AppError, Result};
use crate::ipc::ControlSocket;
use crate::video::CodecKind;
use crate::webrtc::rtp::{VIDEO_CLOCK_RATE, VIDEO_PAYLOAD_TYPE};

/// Public STUN server used for candidate gathering
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Media stream label shared by every peer's video track
const STREAM_LABEL: &str = "video-stream";

/// A candidate received before the remote description was set
#[derive(Debug, Clone)]
pub struct PendingCandidate {
    pub candidate: String,
    pub mid: Option<String>,
}

pub struct PeerSession {
    pub id: String,
    pc: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticRTP>,
    data_channel: Arc<RTCDataChannel>,
    ready: Arc<AtomicBool>,
    defunct: Arc<AtomicBool>,
    has_remote_description: AtomicBool,
    pending_candidates: Mutex<Vec<PendingCandidate>>,
}

impl PeerSession {
    /// Create the peer connection, add the send-only video track and the
    /// `input` data channel, set the local description, and wait for ICE
    /// gathering to complete. Returns the session plus the local SDP to
    /// hand to the signaling transport.
    pub async fn connect(
        id: String,
        codec: CodecKind,
        control: Arc<ControlSocket>,
        keyframe_request: Arc<AtomicBool>,
    ) -> Result<(Arc<Self>, String, String)> {
        let mime_type = match codec {
            CodecKind::Vp8 => MIME_TYPE_VP8,
            CodecKind::H264 => MIME_TYPE_H264,
        };
        let capability = RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: capability.clone(),
                    payload_type: VIDEO_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| AppError::WebRtcError(format!("codec registration failed: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtcError(format!("interceptor registration failed: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![STUN_SERVER.to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| AppError::WebRtcError(format!("peer connection failed: {}", e)))?,
        );

        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            "video".to_owned(),
            STREAM_LABEL.to_owned(),
        ));

        let transceiver = pc
            .add_transceiver_from_track(
                track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| AppError::WebRtcError(format!("add track failed: {}", e)))?;
        let rtp_sender = transceiver.sender().await;

        // Drain incoming RTCP so the interceptors keep flowing
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        let data_channel = pc
            .create_data_channel("input", None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("data channel failed: {}", e)))?;

        let ready = Arc::new(AtomicBool::new(false));
        let defunct = Arc::new(AtomicBool::new(false));

        {
            let ready = ready.clone();
            let defunct = defunct.clone();
            let peer_id = id.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let ready = ready.clone();
                let defunct = defunct.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    tracing::info!("Peer {} connection state: {}", peer_id, state);
                    match state {
                        RTCPeerConnectionState::Connected => {
                            ready.store(true, Ordering::Release);
                        }
                        RTCPeerConnectionState::Disconnected => {
                            ready.store(false, Ordering::Release);
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            ready.store(false, Ordering::Release);
                            defunct.store(true, Ordering::Release);
                        }
                        _ => {}
                    }
                })
            }));
        }

        {
            let peer_id = id.clone();
            data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
                let control = control.clone();
                let keyframe_request = keyframe_request.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let text = String::from_utf8_lossy(&msg.data).into_owned();
                    if is_keyframe_request(&text) {
                        tracing::debug!("Peer {} requested a keyframe", peer_id);
                        keyframe_request.store(true, Ordering::Release);
                        return;
                    }
                    // Input events relay verbatim to the emulator
                    if !control.send_line(&text).await {
                        tracing::debug!("Dropped input from {}: emulator not connected", peer_id);
                    }
                })
            }));
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("create offer failed: {}", e)))?;

        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("set local description failed: {}", e)))?;
        let _ = gather_complete.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("no local description after gathering".into()))?;

        let session = Arc::new(Self {
            id,
            pc,
            track,
            data_channel,
            ready,
            defunct,
            has_remote_description: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
        });

        Ok((session, local.sdp_type.to_string(), local.sdp))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct.load(Ordering::Acquire)
    }

    /// Apply the browser's answer, then drain queued candidates in arrival
    /// order. Queuing is mandatory: candidates can reach the server before
    /// the answer is processed.
    pub async fn apply_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| AppError::WebRtcError(format!("malformed answer: {}", e)))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("set remote description failed: {}", e)))?;
        self.has_remote_description.store(true, Ordering::Release);

        let queued: Vec<PendingCandidate> =
            std::mem::take(&mut *self.pending_candidates.lock().await);
        if !queued.is_empty() {
            tracing::debug!("Applying {} queued candidates for {}", queued.len(), self.id);
        }
        for pending in queued {
            self.apply_candidate(pending).await;
        }
        Ok(())
    }

    /// Add a remote candidate now, or queue it until the answer arrives
    pub async fn add_candidate(&self, candidate: String, mid: Option<String>) {
        let pending = PendingCandidate { candidate, mid };
        if self.has_remote_description.load(Ordering::Acquire) {
            self.apply_candidate(pending).await;
        } else {
            self.pending_candidates.lock().await.push(pending);
        }
    }

    async fn apply_candidate(&self, pending: PendingCandidate) {
        let init = RTCIceCandidateInit {
            candidate: pending.candidate,
            sdp_mid: pending.mid,
            ..Default::default()
        };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            tracing::warn!("Failed to add candidate for {}: {}", self.id, e);
        }
    }

    /// Send every packet of one frame to this peer. Write errors are
    /// contained here so fan-out to other peers continues.
    pub async fn send_packets(&self, packets: &[Packet]) {
        for packet in packets {
            if let Err(e) = self.track.write_rtp(packet).await {
                tracing::debug!("Send to {} failed: {}", self.id, e);
                break;
            }
        }
    }

    pub async fn close(&self) {
        self.ready.store(false, Ordering::Release);
        if let Err(e) = self.data_channel.close().await {
            tracing::debug!("Data channel close for {} failed: {}", self.id, e);
        }
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Close of {} failed: {}", self.id, e);
        }
    }
}

/// A PLI-equivalent sent over the data channel instead of an input event
fn is_keyframe_request(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(String::from))
        .is_some_and(|t| t == "request_keyframe")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_requests_are_recognized() {
        assert!(is_keyframe_request("{\"type\":\"request_keyframe\"}"));
        assert!(!is_keyframe_request("{\"type\":\"mouse_move\",\"x\":1,\"y\":2}"));
        assert!(!is_keyframe_request("not json"));
    }
}
