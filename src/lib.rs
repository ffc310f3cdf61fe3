//! macemu WebRTC streaming gateway
//!
//! Bridges a BasiliskII/SheepShaver emulator process to web browsers:
//! frames arrive through a triple-buffered shared-memory region, are
//! encoded in realtime, packetized as RTP, and fanned out to WebRTC peers;
//! browser input comes back over data channels and a local control socket.

pub mod config;
pub mod emulator;
pub mod error;
pub mod ipc;
pub mod pipeline;
pub mod prefs;
pub mod state;
pub mod storage;
pub mod video;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
