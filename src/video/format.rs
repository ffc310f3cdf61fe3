//! Pixel format and resolution types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ipc::layout::{PIXEL_FORMAT_BGRA, PIXEL_FORMAT_RGBA};

/// Source pixel layouts the emulator can publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// R, G, B, A byte order
    Rgba,
    /// B, G, R, A byte order
    Bgra,
}

impl PixelFormat {
    /// Map the shared-memory format tag; unknown tags fall back to RGBA
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            PIXEL_FORMAT_BGRA => PixelFormat::Bgra,
            _ => PixelFormat::Rgba,
        }
    }

    pub fn to_tag(self) -> u32 {
        match self {
            PixelFormat::Rgba => PIXEL_FORMAT_RGBA,
            PixelFormat::Bgra => PIXEL_FORMAT_BGRA,
        }
    }

    /// Byte offsets of the red, green, and blue channels within a pixel
    pub fn rgb_offsets(self) -> (usize, usize, usize) {
        match self {
            PixelFormat::Rgba => (0, 1, 2),
            PixelFormat::Bgra => (2, 1, 0),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Rgba => write!(f, "RGBA"),
            PixelFormat::Bgra => write!(f, "BGRA"),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const SVGA: Resolution = Resolution {
        width: 800,
        height: 600,
    };
    pub const UHD4K: Resolution = Resolution {
        width: 3840,
        height: 2160,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_tags_round_trip() {
        assert_eq!(PixelFormat::from_tag(0), PixelFormat::Rgba);
        assert_eq!(PixelFormat::from_tag(1), PixelFormat::Bgra);
        assert_eq!(PixelFormat::Rgba.to_tag(), 0);
        assert_eq!(PixelFormat::Bgra.to_tag(), 1);
        // Unknown tags are treated as RGBA rather than rejected
        assert_eq!(PixelFormat::from_tag(7), PixelFormat::Rgba);
    }

    #[test]
    fn channel_offsets_follow_byte_order() {
        assert_eq!(PixelFormat::Rgba.rgb_offsets(), (0, 1, 2));
        assert_eq!(PixelFormat::Bgra.rgb_offsets(), (2, 1, 0));
    }
}
