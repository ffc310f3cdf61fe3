//! Video encoder drivers
//!
//! The driver is polymorphic over VP8 and H.264; both honor the same
//! init/encode/request_keyframe/is_keyframe capability set. The orchestrator
//! owns exactly one driver and never shares it across tasks.

pub mod h264;
pub mod vp8;

use bytes::Bytes;

use crate::error::Result;
use crate::video::format::PixelFormat;

pub use h264::H264Encoder;
pub use vp8::Vp8Encoder;

/// Default encode target bitrate
pub const DEFAULT_BITRATE_KBPS: u32 = 2000;

/// Automatic keyframe distance in frames
pub const KEYFRAME_INTERVAL: u32 = 15;

/// Selectable codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Vp8,
    H264,
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecKind::Vp8 => write!(f, "VP8"),
            CodecKind::H264 => write!(f, "H264"),
        }
    }
}

/// Encoder tuning shared by both drivers
#[derive(Debug, Clone, Copy)]
pub struct EncoderSettings {
    pub fps: u32,
    pub bitrate_kbps: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            fps: 30,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
        }
    }
}

/// Realtime video encoder driver.
///
/// `encode` re-initializes the codec when the source geometry changes; the
/// first frame after (re)init is a keyframe. An empty bitstream means the
/// codec produced nothing for this frame and the caller skips it.
pub trait VideoEncoder: Send {
    fn codec(&self) -> CodecKind;

    /// Encode one source frame. Source rows are addressed by `stride`.
    fn encode(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> Result<Bytes>;

    /// Force the next encoded frame to be a keyframe, overriding the
    /// automatic keyframe schedule
    fn request_keyframe(&mut self);

    /// Inspect a bitstream produced by this driver
    fn is_keyframe(&self, bitstream: &[u8]) -> bool;
}

/// Build a driver for the requested codec
pub fn create_encoder(kind: CodecKind, settings: EncoderSettings) -> Box<dyn VideoEncoder> {
    match kind {
        CodecKind::Vp8 => Box::new(Vp8Encoder::new(settings)),
        CodecKind::H264 => Box::new(H264Encoder::new(settings)),
    }
}
