//! H.264 encoder driver over openh264
//!
//! Shares the VP8 driver's contract: realtime encode, geometry-change
//! reinit, forced keyframes. Keyframes are recognized by scanning the
//! Annex B bitstream for an IDR NAL unit (type 5) rather than by any
//! single-bit heuristic.

use bytes::Bytes;
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVSource;
use openh264::OpenH264API;
use tracing::{debug, warn};

use super::{CodecKind, EncoderSettings, VideoEncoder};
use crate::error::{AppError, Result};
use crate::video::convert::{convert_to_i420, Yuv420Buffer};
use crate::video::format::PixelFormat;

struct ScratchSource<'a>(&'a Yuv420Buffer);

impl<'a> YUVSource for ScratchSource<'a> {
    fn dimensions(&self) -> (usize, usize) {
        (self.0.width(), self.0.height())
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.0.width(), self.0.width() / 2, self.0.width() / 2)
    }

    fn y(&self) -> &[u8] {
        self.0.y_plane()
    }

    fn u(&self) -> &[u8] {
        self.0.u_plane()
    }

    fn v(&self) -> &[u8] {
        self.0.v_plane()
    }
}

pub struct H264Encoder {
    inner: Option<Encoder>,
    scratch: Option<Yuv420Buffer>,
    width: u32,
    height: u32,
    settings: EncoderSettings,
    force_keyframe: bool,
}

impl H264Encoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            inner: None,
            scratch: None,
            width: 0,
            height: 0,
            settings,
            force_keyframe: true,
        }
    }

    fn init_codec(&mut self, width: u32, height: u32) -> Result<()> {
        if self.inner.is_some() && width == self.width && height == self.height {
            return Ok(());
        }

        let config = EncoderConfig::new()
            .max_frame_rate(self.settings.fps as f32)
            .set_bitrate_bps(self.settings.bitrate_kbps * 1000);

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config).map_err(|e| {
            AppError::EncoderError {
                codec: "H264".into(),
                reason: e.to_string(),
            }
        })?;

        self.inner = Some(encoder);
        self.scratch = Some(Yuv420Buffer::new(width as usize, height as usize));
        self.width = width;
        self.height = height;
        self.force_keyframe = true;
        debug!(
            "H264 encoder initialized {}x{} @ {} kbps",
            width, height, self.settings.bitrate_kbps
        );
        Ok(())
    }
}

impl VideoEncoder for H264Encoder {
    fn codec(&self) -> CodecKind {
        CodecKind::H264
    }

    fn encode(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> Result<Bytes> {
        self.init_codec(width, height)?;

        let scratch = self.scratch.as_mut().expect("initialized above");
        convert_to_i420(
            data,
            width as usize,
            height as usize,
            stride as usize,
            format,
            &mut scratch.planes_mut(),
        );

        let encoder = self.inner.as_mut().expect("initialized above");
        if self.force_keyframe {
            self.force_keyframe = false;
            encoder.force_intra_frame();
        }

        let scratch = self.scratch.as_ref().expect("initialized above");
        match encoder.encode(&ScratchSource(scratch)) {
            Ok(bitstream) => Ok(Bytes::from(bitstream.to_vec())),
            Err(e) => {
                warn!("H264 encode failed: {}", e);
                Ok(Bytes::new())
            }
        }
    }

    fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    fn is_keyframe(&self, bitstream: &[u8]) -> bool {
        is_h264_keyframe(bitstream)
    }
}

/// Scan Annex B data for an IDR NAL unit (type 5)
pub fn is_h264_keyframe(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            let nal_start = if data[i + 2] == 1 {
                i + 3
            } else if i + 4 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                i + 4
            } else {
                i += 1;
                continue;
            };

            if nal_start < data.len() && data[nal_start] & 0x1F == 5 {
                return true;
            }
            i = nal_start;
        } else {
            i += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyframe_scan_inspects_nal_types() {
        // IDR slice with 4-byte start code
        assert!(is_h264_keyframe(&[0x00, 0x00, 0x00, 0x01, 0x65]));
        // IDR slice with 3-byte start code
        assert!(is_h264_keyframe(&[0x00, 0x00, 0x01, 0x65]));
        // Non-IDR slice
        assert!(!is_h264_keyframe(&[0x00, 0x00, 0x00, 0x01, 0x41]));
        // SPS alone is not a keyframe
        assert!(!is_h264_keyframe(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        // SPS + PPS + IDR
        let access_unit = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F, //
            0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80, //
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84,
        ];
        assert!(is_h264_keyframe(&access_unit));
        assert!(!is_h264_keyframe(&[]));
    }

    #[test]
    fn first_encoded_frame_contains_an_idr() {
        let mut enc = H264Encoder::new(EncoderSettings::default());
        let frame = vec![0x80u8; 64 * 64 * 4];
        let bits = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(!bits.is_empty());
        assert!(enc.is_keyframe(&bits));
    }

    #[test]
    fn keyframe_request_is_honored() {
        let mut enc = H264Encoder::new(EncoderSettings::default());
        let frame = vec![0x80u8; 64 * 64 * 4];

        let _ = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        let delta = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(!enc.is_keyframe(&delta));

        enc.request_keyframe();
        let forced = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(enc.is_keyframe(&forced));
    }
}
