//! Output image matrix and converter configuration types.

use ndarray::Array3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ColorFormat {
    #[default]
    Rgba,
    Rgb,
    Bgra,
    Bgr,
    Gray,
}

impl ColorFormat {
    pub fn channels(self) -> usize {
        match self {
            ColorFormat::Rgba | ColorFormat::Bgra => 4,
            ColorFormat::Rgb | ColorFormat::Bgr => 3,
            ColorFormat::Gray => 1,
        }
    }

    pub(crate) fn to_pixel(self) -> ffmpeg::format::Pixel {
        use ffmpeg::format::Pixel;
        match self {
            ColorFormat::Rgba => Pixel::RGBA,
            ColorFormat::Rgb => Pixel::RGB24,
            ColorFormat::Bgra => Pixel::BGRA,
            ColorFormat::Bgr => Pixel::BGR24,
            ColorFormat::Gray => Pixel::GRAY8,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum MatDataType {
    #[default]
    U8,
    F32,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum InterpMode {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Area,
}

impl InterpMode {
    pub(crate) fn to_sws_flags(self) -> ffmpeg::software::scaling::Flags {
        use ffmpeg::software::scaling::Flags;
        match self {
            InterpMode::Nearest => Flags::POINT,
            InterpMode::Bilinear => Flags::BILINEAR,
            InterpMode::Bicubic => Flags::BICUBIC,
            InterpMode::Area => Flags::AREA,
        }
    }
}

/// Pixel data of a converted frame, `(height, width, channel)` layout.
#[derive(Debug, Clone)]
pub enum MatData {
    U8(Array3<u8>),
    F32(Array3<f32>),
}

/// The converted image handed to clients, with the media timestamp it was
/// produced for.
#[derive(Debug, Clone)]
pub struct Mat {
    pub data: MatData,
    pub color_format: ColorFormat,
    pub timestamp_ms: i64,
}

impl Mat {
    pub fn width(&self) -> u32 {
        match &self.data {
            MatData::U8(a) => a.dim().1 as u32,
            MatData::F32(a) => a.dim().1 as u32,
        }
    }

    pub fn height(&self) -> u32 {
        match &self.data {
            MatData::U8(a) => a.dim().0 as u32,
            MatData::F32(a) => a.dim().0 as u32,
        }
    }

    pub fn channels(&self) -> usize {
        match &self.data {
            MatData::U8(a) => a.dim().2,
            MatData::F32(a) => a.dim().2,
        }
    }

    pub fn data_type(&self) -> MatDataType {
        match &self.data {
            MatData::U8(_) => MatDataType::U8,
            MatData::F32(_) => MatDataType::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_mat_dimensions() {
        let mat = Mat {
            data: MatData::U8(Array3::zeros((480, 640, 4))),
            color_format: ColorFormat::Rgba,
            timestamp_ms: 40,
        };
        assert_eq!(mat.width(), 640);
        assert_eq!(mat.height(), 480);
        assert_eq!(mat.channels(), 4);
        assert_eq!(mat.data_type(), MatDataType::U8);
    }

    #[test]
    fn test_color_format_channels() {
        assert_eq!(ColorFormat::Rgba.channels(), 4);
        assert_eq!(ColorFormat::Rgb.channels(), 3);
        assert_eq!(ColorFormat::Gray.channels(), 1);
    }

    #[test]
    fn test_config_enums_serde_round_trip() {
        let json = serde_json::to_string(&(
            ColorFormat::Bgra,
            MatDataType::F32,
            InterpMode::Bicubic,
        ))
        .unwrap();
        let (fmt, dtype, interp): (ColorFormat, MatDataType, InterpMode) =
            serde_json::from_str(&json).unwrap();
        assert_eq!(fmt, ColorFormat::Bgra);
        assert_eq!(dtype, MatDataType::F32);
        assert_eq!(interp, InterpMode::Bicubic);
    }
}
