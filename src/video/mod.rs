//! Video formats, color conversion, and encoder drivers

pub mod convert;
pub mod encoder;
pub mod format;

pub use encoder::{create_encoder, CodecKind, EncoderSettings, VideoEncoder};
pub use format::{PixelFormat, Resolution};
