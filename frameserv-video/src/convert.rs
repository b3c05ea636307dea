//! Pixel converter: colorspace + resize into the output matrix.

use std::ops::{Deref, DerefMut};

use anyhow::{Context, Result};
use ffmpeg::{
    format::Pixel,
    software::scaling,
    util::frame::video::Video,
};
use ndarray::Array3;

use crate::mat::{ColorFormat, InterpMode, Mat, MatData, MatDataType};

/// Converts decoded frames into the client-requested matrix format.
/// The scaling context is cached and rebuilt only when the source geometry,
/// source format or output settings change.
pub struct FrameConverter {
    out_size: Option<(u32, u32)>,
    scale_factors: Option<(f32, f32)>,
    color_format: ColorFormat,
    data_type: MatDataType,
    interp: InterpMode,
    sws: Option<CachedScaler>,
    /// Reused across conversions to avoid per-frame allocation.
    dst_frame: Video,
}

struct CachedScaler {
    ctx: SendableSwsCtx,
    key: ScalerKey,
}

#[derive(PartialEq, Eq, Clone, Copy)]
struct ScalerKey {
    src_format: Pixel,
    src_size: (u32, u32),
    dst_format: Pixel,
    dst_size: (u32, u32),
    interp: InterpMode,
}

impl FrameConverter {
    pub fn new() -> FrameConverter {
        FrameConverter {
            out_size: None,
            scale_factors: None,
            color_format: ColorFormat::default(),
            data_type: MatDataType::default(),
            interp: InterpMode::default(),
            sws: None,
            dst_frame: Video::empty(),
        }
    }

    /// Fixed output size. `0` on either axis means keep that axis native.
    pub fn set_out_size(&mut self, width: u32, height: u32) {
        self.out_size = Some((width, height));
        self.scale_factors = None;
        self.sws = None;
    }

    /// Output size as factors of the native size.
    pub fn set_scale_factors(&mut self, width_factor: f32, height_factor: f32) {
        self.scale_factors = Some((width_factor, height_factor));
        self.out_size = None;
        self.sws = None;
    }

    pub fn set_out_color_format(&mut self, format: ColorFormat) {
        self.color_format = format;
        self.sws = None;
    }

    pub fn set_out_data_type(&mut self, data_type: MatDataType) {
        self.data_type = data_type;
    }

    pub fn set_resize_interpolate_mode(&mut self, interp: InterpMode) {
        self.interp = interp;
        self.sws = None;
    }

    pub fn out_size(&self) -> Option<(u32, u32)> {
        self.out_size
    }

    pub fn out_color_format(&self) -> ColorFormat {
        self.color_format
    }

    pub fn out_data_type(&self) -> MatDataType {
        self.data_type
    }

    pub fn resize_interpolate_mode(&self) -> InterpMode {
        self.interp
    }

    /// Output dimensions for a source of `(w, h)`, even-aligned like the
    /// scaler expects.
    pub fn dst_size_for(&self, src_w: u32, src_h: u32) -> (u32, u32) {
        let (mut w, mut h) = match (self.out_size, self.scale_factors) {
            (Some((w, h)), _) => (
                if w == 0 { src_w } else { w },
                if h == 0 { src_h } else { h },
            ),
            (None, Some((fw, fh))) => (
                (src_w as f32 * fw).round() as u32,
                (src_h as f32 * fh).round() as u32,
            ),
            (None, None) => (src_w, src_h),
        };
        w = w.max(2) & !1;
        h = h.max(2) & !1;
        (w, h)
    }

    pub fn convert_image(&mut self, frame: &Video, timestamp_ms: i64) -> Result<Mat> {
        let (src_w, src_h) = (frame.width(), frame.height());
        let (dst_w, dst_h) = self.dst_size_for(src_w, src_h);
        let dst_format = self.color_format.to_pixel();
        let key = ScalerKey {
            src_format: frame.format(),
            src_size: (src_w, src_h),
            dst_format,
            dst_size: (dst_w, dst_h),
            interp: self.interp,
        };
        let cached = matches!(&self.sws, Some(cached) if cached.key == key);
        if !cached {
            let ctx = scaling::Context::get(
                frame.format(),
                src_w,
                src_h,
                dst_format,
                dst_w,
                dst_h,
                self.interp.to_sws_flags(),
            )
            .context("failed to create scaling context")?;
            self.sws = Some(CachedScaler {
                ctx: SendableSwsCtx(ctx),
                key,
            });
        }
        let sws = &mut self.sws.as_mut().unwrap().ctx;

        sws.run(frame, &mut self.dst_frame)
            .context("scaling failed")?;

        let channels = self.color_format.channels();
        let stride = self.dst_frame.stride(0);
        let raw = self.dst_frame.data(0);
        let row_bytes = dst_w as usize * channels;
        let data = match self.data_type {
            MatDataType::U8 => {
                let mut out = Array3::<u8>::zeros((dst_h as usize, dst_w as usize, channels));
                {
                    let slice = out.as_slice_mut().unwrap();
                    for row in 0..dst_h as usize {
                        let src = &raw[row * stride..row * stride + row_bytes];
                        slice[row * row_bytes..(row + 1) * row_bytes].copy_from_slice(src);
                    }
                }
                MatData::U8(out)
            }
            MatDataType::F32 => {
                let mut out = Array3::<f32>::zeros((dst_h as usize, dst_w as usize, channels));
                {
                    let slice = out.as_slice_mut().unwrap();
                    for row in 0..dst_h as usize {
                        let src = &raw[row * stride..row * stride + row_bytes];
                        for (dst, &b) in slice[row * row_bytes..(row + 1) * row_bytes]
                            .iter_mut()
                            .zip(src)
                        {
                            *dst = b as f32 / 255.0;
                        }
                    }
                }
                MatData::F32(out)
            }
        };

        Ok(Mat {
            data,
            color_format: self.color_format,
            timestamp_ms,
        })
    }
}

impl Default for FrameConverter {
    fn default() -> Self {
        FrameConverter::new()
    }
}

/// Wrap `Context` to pass between threads(because of the raw pointer).
struct SendableSwsCtx(scaling::Context);

#[allow(clippy::non_send_fields_in_send_ty)]
unsafe impl Send for SendableSwsCtx {}

impl Deref for SendableSwsCtx {
    type Target = scaling::Context;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SendableSwsCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dst_size_native() {
        let cvt = FrameConverter::new();
        assert_eq!(cvt.dst_size_for(1280, 720), (1280, 720));
    }

    #[test]
    fn test_dst_size_fixed() {
        let mut cvt = FrameConverter::new();
        cvt.set_out_size(640, 0);
        assert_eq!(cvt.dst_size_for(1280, 720), (640, 720));
        cvt.set_out_size(641, 333);
        assert_eq!(cvt.dst_size_for(1280, 720), (640, 332));
    }

    #[test]
    fn test_dst_size_factors() {
        let mut cvt = FrameConverter::new();
        cvt.set_scale_factors(0.5, 0.5);
        assert_eq!(cvt.dst_size_for(1280, 720), (640, 360));
        cvt.set_scale_factors(0.001, 0.001);
        assert_eq!(cvt.dst_size_for(1280, 720), (2, 2));
    }
}
