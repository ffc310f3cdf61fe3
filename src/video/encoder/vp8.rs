//! VP8 encoder driver over libvpx
//!
//! Realtime, single-threaded, CBR with an automatic keyframe distance of
//! 15 frames. A forced-keyframe request is honored on the next encode call
//! via `VPX_EFLAG_FORCE_KF`. Keyframes are recognized from the bitstream:
//! the low bit of the first byte of a VP8 frame is the inverse-keyframe
//! flag.

use std::os::raw::{c_int, c_uint};
use std::ptr;

use bytes::Bytes;
use vpx_sys as vpx;
use tracing::{debug, warn};

use super::{CodecKind, EncoderSettings, VideoEncoder, KEYFRAME_INTERVAL};
use crate::error::{AppError, Result};
use crate::video::convert::{convert_to_i420, PlanarYuv};
use crate::video::format::PixelFormat;

pub struct Vp8Encoder {
    ctx: vpx::vpx_codec_ctx_t,
    image: *mut vpx::vpx_image_t,
    width: u32,
    height: u32,
    settings: EncoderSettings,
    /// Monotonic presentation counter
    pts: i64,
    /// Initially set so the first emitted frame is a keyframe
    force_keyframe: bool,
    initialized: bool,
}

// The codec context holds raw pointers but the driver lives on a single
// task; encode calls are strictly sequential.
unsafe impl Send for Vp8Encoder {}

impl Vp8Encoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            ctx: unsafe { std::mem::zeroed() },
            image: ptr::null_mut(),
            width: 0,
            height: 0,
            settings,
            pts: 0,
            force_keyframe: true,
            initialized: false,
        }
    }

    /// (Re)initialize the codec context for the given geometry.
    /// Idempotent for unchanged geometry.
    fn init_codec(&mut self, width: u32, height: u32) -> Result<()> {
        if self.initialized && width == self.width && height == self.height {
            return Ok(());
        }
        self.teardown();

        unsafe {
            let iface = vpx::vpx_codec_vp8_cx();

            let mut cfg = std::mem::MaybeUninit::<vpx::vpx_codec_enc_cfg_t>::zeroed().assume_init();
            if vpx::vpx_codec_enc_config_default(iface, &mut cfg, 0)
                != vpx::vpx_codec_err_t::VPX_CODEC_OK
            {
                return Err(AppError::EncoderError {
                    codec: "VP8".into(),
                    reason: "default config unavailable".into(),
                });
            }

            cfg.g_w = width as c_uint;
            cfg.g_h = height as c_uint;
            cfg.g_timebase.num = 1;
            cfg.g_timebase.den = self.settings.fps as c_int;
            cfg.rc_target_bitrate = self.settings.bitrate_kbps as c_uint;
            cfg.rc_end_usage = vpx::vpx_rc_mode::VPX_CBR;
            cfg.g_error_resilient = vpx::VPX_ERROR_RESILIENT_DEFAULT as vpx::vpx_codec_er_flags_t;
            cfg.g_lag_in_frames = 0;
            cfg.kf_mode = vpx::vpx_kf_mode::VPX_KF_AUTO;
            cfg.kf_max_dist = KEYFRAME_INTERVAL as c_uint;
            cfg.g_threads = 1;

            if vpx::vpx_codec_enc_init_ver(
                &mut self.ctx,
                iface,
                &cfg,
                0,
                vpx::VPX_ENCODER_ABI_VERSION as c_int,
            ) != vpx::vpx_codec_err_t::VPX_CODEC_OK
            {
                return Err(AppError::EncoderError {
                    codec: "VP8".into(),
                    reason: "encoder init failed".into(),
                });
            }

            self.image = vpx::vpx_img_alloc(
                ptr::null_mut(),
                vpx::vpx_img_fmt::VPX_IMG_FMT_I420,
                width as c_uint,
                height as c_uint,
                16,
            );
            if self.image.is_null() {
                vpx::vpx_codec_destroy(&mut self.ctx);
                return Err(AppError::EncoderError {
                    codec: "VP8".into(),
                    reason: "image allocation failed".into(),
                });
            }
        }

        self.width = width;
        self.height = height;
        self.initialized = true;
        // The first frame out of a fresh context is a keyframe
        self.force_keyframe = true;
        debug!(
            "VP8 encoder initialized {}x{} @ {} kbps",
            width, height, self.settings.bitrate_kbps
        );
        Ok(())
    }

    fn teardown(&mut self) {
        unsafe {
            if self.initialized {
                vpx::vpx_codec_destroy(&mut self.ctx);
                self.initialized = false;
            }
            if !self.image.is_null() {
                vpx::vpx_img_free(self.image);
                self.image = ptr::null_mut();
            }
        }
    }

    /// Convert the source frame into the codec's I420 scratch image
    fn fill_image(&mut self, data: &[u8], stride: u32, format: PixelFormat) {
        let img = unsafe { &mut *self.image };
        let height = self.height as usize;
        let chroma_rows = height.div_ceil(2);

        let y_stride = img.stride[0] as usize;
        let u_stride = img.stride[1] as usize;
        let v_stride = img.stride[2] as usize;

        let mut planes = unsafe {
            PlanarYuv {
                y: std::slice::from_raw_parts_mut(img.planes[0], y_stride * height),
                u: std::slice::from_raw_parts_mut(img.planes[1], u_stride * chroma_rows),
                v: std::slice::from_raw_parts_mut(img.planes[2], v_stride * chroma_rows),
                y_stride,
                u_stride,
                v_stride,
            }
        };

        convert_to_i420(
            data,
            self.width as usize,
            height,
            stride as usize,
            format,
            &mut planes,
        );
    }
}

impl VideoEncoder for Vp8Encoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Vp8
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
        self.fill_image(data, stride, format);

        let flags: vpx::vpx_enc_frame_flags_t = if self.force_keyframe {
            self.force_keyframe = false;
            vpx::VPX_EFLAG_FORCE_KF as vpx::vpx_enc_frame_flags_t
        } else {
            0
        };

        let pts = self.pts;
        self.pts += 1;

        let mut out = Vec::new();
        unsafe {
            if vpx::vpx_codec_encode(
                &mut self.ctx,
                self.image,
                pts,
                1,
                flags,
                vpx::VPX_DL_REALTIME as u64,
            ) != vpx::vpx_codec_err_t::VPX_CODEC_OK
            {
                warn!("VP8 encode failed at pts {}", pts);
                return Ok(Bytes::new());
            }

            let mut iter: vpx::vpx_codec_iter_t = ptr::null();
            loop {
                let pkt = vpx::vpx_codec_get_cx_data(&mut self.ctx, &mut iter);
                if pkt.is_null() {
                    break;
                }
                if (*pkt).kind == vpx::vpx_codec_cx_pkt_kind::VPX_CODEC_CX_FRAME_PKT {
                    let frame = (*pkt).data.frame;
                    let bytes = std::slice::from_raw_parts(frame.buf as *const u8, frame.sz as usize);
                    out.extend_from_slice(bytes);
                }
            }
        }

        Ok(Bytes::from(out))
    }

    fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    fn is_keyframe(&self, bitstream: &[u8]) -> bool {
        is_vp8_keyframe(bitstream)
    }
}

impl Drop for Vp8Encoder {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// The low bit of the first VP8 bitstream byte is the inverse-keyframe flag
pub fn is_vp8_keyframe(bitstream: &[u8]) -> bool {
    !bitstream.is_empty() && bitstream[0] & 0x01 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(width: u32, height: u32) -> Vec<u8> {
        vec![0x80u8; (width * height * 4) as usize]
    }

    #[test]
    fn first_frame_is_a_keyframe() {
        let mut enc = Vp8Encoder::new(EncoderSettings::default());
        let frame = gray_frame(64, 64);
        let bits = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(!bits.is_empty());
        assert!(enc.is_keyframe(&bits));
    }

    #[test]
    fn keyframe_request_overrides_the_auto_schedule() {
        let mut enc = Vp8Encoder::new(EncoderSettings::default());
        let frame = gray_frame(64, 64);

        let first = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(enc.is_keyframe(&first));

        let second = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(!enc.is_keyframe(&second));

        enc.request_keyframe();
        let third = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(enc.is_keyframe(&third));

        // The request is one-shot
        let fourth = enc.encode(&frame, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(!enc.is_keyframe(&fourth));
    }

    #[test]
    fn geometry_change_forces_reinit_and_keyframe() {
        let mut enc = Vp8Encoder::new(EncoderSettings::default());

        let small = gray_frame(64, 64);
        let _ = enc.encode(&small, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        let delta = enc.encode(&small, 64, 64, 64 * 4, PixelFormat::Rgba).unwrap();
        assert!(!enc.is_keyframe(&delta));

        let large = gray_frame(128, 96);
        let bits = enc
            .encode(&large, 128, 96, 128 * 4, PixelFormat::Rgba)
            .unwrap();
        assert!(enc.is_keyframe(&bits));
    }

    #[test]
    fn same_geometry_init_is_idempotent() {
        let mut enc = Vp8Encoder::new(EncoderSettings::default());
        enc.init_codec(64, 64).unwrap();
        let image = enc.image;
        enc.init_codec(64, 64).unwrap();
        assert_eq!(enc.image, image);
    }

    #[test]
    fn keyframe_flag_reads_the_low_bit() {
        assert!(is_vp8_keyframe(&[0x10, 0x00]));
        assert!(!is_vp8_keyframe(&[0x11, 0x00]));
        assert!(!is_vp8_keyframe(&[]));
    }
}
