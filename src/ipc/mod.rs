//! Shared-memory and control-socket IPC with the emulator process

pub mod audio;
pub mod control;
pub mod layout;
pub mod video;

pub use audio::AudioSharedMemory;
pub use control::{ControlSocket, EmulatorMessage};
pub use video::{FrameView, VideoSharedMemory};
