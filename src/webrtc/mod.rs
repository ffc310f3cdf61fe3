//! WebRTC delivery: packetization, peer sessions, and signaling

pub mod peer;
pub mod rtp;
pub mod session;
pub mod signaling;

pub use peer::PeerSession;
pub use rtp::RtpPacketizer;
pub use session::PeerSessionManager;
