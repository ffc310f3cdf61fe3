//! Color space conversion
//!
//! RGBA/BGRA to planar I420 using the canonical BT.601 limited-range
//! integer approximation. Chroma is 4:2:0, computed from a 2x2 box-averaged
//! RGB. Source rows are addressed by `stride`, never by `width`; the
//! destination planes carry their own strides, which the codec chooses and
//! may exceed the width.

use crate::video::format::PixelFormat;

/// Mutable view over three destination planes with codec-chosen strides
pub struct PlanarYuv<'a> {
    pub y: &'a mut [u8],
    pub u: &'a mut [u8],
    pub v: &'a mut [u8],
    pub y_stride: usize,
    pub u_stride: usize,
    pub v_stride: usize,
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

#[inline]
fn chroma_u(r: i32, g: i32, b: i32) -> u8 {
    (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8
}

#[inline]
fn chroma_v(r: i32, g: i32, b: i32) -> u8 {
    (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8
}

/// Convert one 32bpp frame into planar I420. Total: no failure paths.
pub fn convert_to_i420(
    src: &[u8],
    width: usize,
    height: usize,
    stride: usize,
    format: PixelFormat,
    dst: &mut PlanarYuv<'_>,
) {
    let (ro, go, bo) = format.rgb_offsets();

    for row in 0..height {
        let src_row = &src[row * stride..];
        let dst_row = &mut dst.y[row * dst.y_stride..];
        for col in 0..width {
            let px = &src_row[col * 4..];
            dst_row[col] = luma(px[ro] as i32, px[go] as i32, px[bo] as i32);
        }
    }

    for row in 0..height / 2 {
        let dst_u = &mut dst.u[row * dst.u_stride..];
        let dst_v = &mut dst.v[row * dst.v_stride..];
        for col in 0..width / 2 {
            let mut r = 0i32;
            let mut g = 0i32;
            let mut b = 0i32;
            for dy in 0..2 {
                let src_row = &src[(row * 2 + dy) * stride..];
                for dx in 0..2 {
                    let px = &src_row[(col * 2 + dx) * 4..];
                    r += px[ro] as i32;
                    g += px[go] as i32;
                    b += px[bo] as i32;
                }
            }
            r /= 4;
            g /= 4;
            b /= 4;
            dst_u[col] = chroma_u(r, g, b);
            dst_v[col] = chroma_v(r, g, b);
        }
    }
}

/// Owned I420 scratch buffer with width-tight strides
pub struct Yuv420Buffer {
    data: Vec<u8>,
    width: usize,
    height: usize,
}

impl Yuv420Buffer {
    pub fn new(width: usize, height: usize) -> Self {
        let y_size = width * height;
        let uv_size = (width / 2) * (height / 2);
        Self {
            data: vec![0u8; y_size + 2 * uv_size],
            width,
            height,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..self.width * self.height]
    }

    pub fn u_plane(&self) -> &[u8] {
        let y_size = self.width * self.height;
        let uv_size = (self.width / 2) * (self.height / 2);
        &self.data[y_size..y_size + uv_size]
    }

    pub fn v_plane(&self) -> &[u8] {
        let y_size = self.width * self.height;
        let uv_size = (self.width / 2) * (self.height / 2);
        &self.data[y_size + uv_size..y_size + 2 * uv_size]
    }

    /// Borrow all three planes mutably for one conversion
    pub fn planes_mut(&mut self) -> PlanarYuv<'_> {
        let y_size = self.width * self.height;
        let uv_size = (self.width / 2) * (self.height / 2);
        let (y, rest) = self.data.split_at_mut(y_size);
        let (u, v) = rest.split_at_mut(uv_size);
        PlanarYuv {
            y,
            u,
            v,
            y_stride: self.width,
            u_stride: self.width / 2,
            v_stride: self.width / 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clamp_u8(v: f32) -> i32 {
        v.round().clamp(0.0, 255.0) as i32
    }

    /// Standard BT.601 limited-range inverse
    fn inverse(y: u8, u: u8, v: u8) -> (i32, i32, i32) {
        let y = y as f32 - 16.0;
        let u = u as f32 - 128.0;
        let v = v as f32 - 128.0;
        (
            clamp_u8(1.164 * y + 1.596 * v),
            clamp_u8(1.164 * y - 0.392 * u - 0.813 * v),
            clamp_u8(1.164 * y + 2.017 * u),
        )
    }

    fn bgra_frame(colors: &[(u8, u8, u8)], width: usize, height: usize, stride: usize) -> Vec<u8> {
        // Each 2x2 block takes one color so subsampled chroma is exact.
        let mut data = vec![0u8; stride * height];
        for row in 0..height {
            for col in 0..width {
                let block = (row / 2) * (width / 2) + col / 2;
                let (r, g, b) = colors[block % colors.len()];
                let px = &mut data[row * stride + col * 4..];
                px[0] = b;
                px[1] = g;
                px[2] = r;
                px[3] = 0xFF;
            }
        }
        data
    }

    #[test]
    fn known_values_for_primaries() {
        let mut buf = Yuv420Buffer::new(2, 2);
        let mut src = vec![0u8; 16];
        // One red 2x2 block in RGBA order
        for px in src.chunks_mut(4) {
            px[0] = 255;
            px[3] = 255;
        }
        convert_to_i420(&src, 2, 2, 8, PixelFormat::Rgba, &mut buf.planes_mut());
        assert_eq!(buf.y_plane()[0], 82);
        assert_eq!(buf.u_plane()[0], 90);
        assert_eq!(buf.v_plane()[0], 240);
    }

    #[test]
    fn gray_maps_to_neutral_chroma() {
        let mut buf = Yuv420Buffer::new(2, 2);
        let src = vec![128u8; 16];
        convert_to_i420(&src, 2, 2, 8, PixelFormat::Bgra, &mut buf.planes_mut());
        assert_eq!(buf.u_plane()[0], 128);
        assert_eq!(buf.v_plane()[0], 128);
        assert_eq!(buf.y_plane()[0], 126);
    }

    #[test]
    fn round_trip_within_two_lsb() {
        let width = 16;
        let height = 8;
        let stride = width * 4;
        let colors: Vec<(u8, u8, u8)> = (0..32)
            .map(|i| {
                let base = (i * 8) as u8;
                (base, base / 2 + 64, 255 - base)
            })
            .collect();
        let src = bgra_frame(&colors, width, height, stride);

        let mut buf = Yuv420Buffer::new(width, height);
        convert_to_i420(&src, width, height, stride, PixelFormat::Bgra, &mut buf.planes_mut());

        for row in 0..height {
            for col in 0..width {
                let y = buf.y_plane()[row * width + col];
                let u = buf.u_plane()[(row / 2) * (width / 2) + col / 2];
                let v = buf.v_plane()[(row / 2) * (width / 2) + col / 2];
                let (r, g, b) = inverse(y, u, v);

                let px = &src[row * stride + col * 4..];
                assert!((b - px[0] as i32).abs() <= 2, "B off at ({},{})", col, row);
                assert!((g - px[1] as i32).abs() <= 2, "G off at ({},{})", col, row);
                assert!((r - px[2] as i32).abs() <= 2, "R off at ({},{})", col, row);
            }
        }
    }

    #[test]
    fn source_rows_are_addressed_by_stride() {
        let width = 4;
        let height = 4;
        let dense_stride = width * 4;
        let padded_stride = dense_stride + 12;
        let colors = [(10u8, 200u8, 60u8), (240, 16, 128)];

        let dense = bgra_frame(&colors, width, height, dense_stride);
        let mut padded = bgra_frame(&colors, width, height, padded_stride);
        // Poison the padding: it must never be read.
        for row in 0..height {
            for extra in dense_stride..padded_stride {
                padded[row * padded_stride + extra] = 0xEE;
            }
        }

        let mut a = Yuv420Buffer::new(width, height);
        let mut b = Yuv420Buffer::new(width, height);
        convert_to_i420(&dense, width, height, dense_stride, PixelFormat::Bgra, &mut a.planes_mut());
        convert_to_i420(&padded, width, height, padded_stride, PixelFormat::Bgra, &mut b.planes_mut());

        assert_eq!(a.y_plane(), b.y_plane());
        assert_eq!(a.u_plane(), b.u_plane());
        assert_eq!(a.v_plane(), b.v_plane());
    }

    #[test]
    fn destination_strides_may_exceed_width() {
        let width = 4;
        let height = 4;
        let src = vec![200u8; width * 4 * height];

        let y_stride = 8;
        let uv_stride = 6;
        let mut y = vec![0u8; y_stride * height];
        let mut u = vec![0u8; uv_stride * (height / 2)];
        let mut v = vec![0u8; uv_stride * (height / 2)];
        let mut planes = PlanarYuv {
            y: &mut y,
            u: &mut u,
            v: &mut v,
            y_stride,
            u_stride: uv_stride,
            v_stride: uv_stride,
        };
        convert_to_i420(&src, width, height, width * 4, PixelFormat::Rgba, &mut planes);

        // Pixels land at the stride positions, padding stays untouched.
        assert_ne!(y[0], 0);
        assert_ne!(y[y_stride], 0);
        assert_eq!(y[width], 0);
        assert_eq!(u[width / 2], 0);
    }
}
