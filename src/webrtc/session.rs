//! Peer session table and frame fan-out

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::RwLock;
use webrtc::rtp::packet::Packet;

use super::peer::PeerSession;
use crate::error::Result;
use crate::ipc::ControlSocket;
use crate::video::CodecKind;

/// Owns every live peer session, keyed by the server-generated id
pub struct PeerSessionManager {
    codec: CodecKind,
    control: Arc<ControlSocket>,
    keyframe_request: Arc<AtomicBool>,
    sessions: RwLock<HashMap<String, Arc<PeerSession>>>,
}

impl PeerSessionManager {
    pub fn new(
        codec: CodecKind,
        control: Arc<ControlSocket>,
        keyframe_request: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            codec,
            control,
            keyframe_request,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Allocate a session and build its offer. Returns (id, sdp type, sdp).
    pub async fn create_session(&self) -> Result<(String, String, String)> {
        let id = uuid::Uuid::new_v4().to_string();
        let (session, sdp_type, sdp) = PeerSession::connect(
            id.clone(),
            self.codec,
            self.control.clone(),
            self.keyframe_request.clone(),
        )
        .await?;

        self.sessions.write().await.insert(id.clone(), session);
        tracing::info!("Peer session created: {}", id);
        Ok((id, sdp_type, sdp))
    }

    pub async fn apply_answer(&self, id: &str, sdp: String) -> Result<()> {
        let session = self.get(id).await?;
        session.apply_answer(sdp).await
    }

    pub async fn add_candidate(&self, id: &str, candidate: String, mid: Option<String>) -> Result<()> {
        let session = self.get(id).await?;
        session.add_candidate(candidate, mid).await;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Arc<PeerSession>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| crate::error::AppError::NotFound(format!("session {}", id)))
    }

    /// Destroy one session (signaling transport closed)
    pub async fn remove_session(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.remove(id) {
            tracing::info!("Peer session removed: {}", id);
            session.close().await;
        }
    }

    /// Send one encoded frame's packets to every ready peer. The session
    /// table lock is held only to snapshot; each peer gets the whole frame
    /// in its own critical section, and a failure on one peer never
    /// affects the others.
    pub async fn fan_out(&self, packets: &[Packet]) {
        if packets.is_empty() {
            return;
        }

        let ready: Vec<Arc<PeerSession>> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.is_ready() && !s.is_defunct())
                .cloned()
                .collect()
        };

        for session in ready {
            session.send_packets(packets).await;
        }
    }

    /// Drop sessions whose peer connection reached Failed/Closed
    pub async fn sweep(&self) {
        let dead: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| s.is_defunct())
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in dead {
            tracing::debug!("Removing defunct peer session: {}", id);
            self.remove_session(&id).await;
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<PeerSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close().await;
        }
    }
}
