use serde::{Deserialize, Serialize};

use hatkit_core::error::{HatError, HatResult};

/// Pixel or container format of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Packed 8-bit RGB
    #[default]
    Rgb,
    /// Packed 8-bit grayscale
    Gray,
    /// YUV 4:2:2, two bytes per pixel
    Yuyv,
    /// Compressed, variable size
    Jpeg,
}

impl ImageFormat {
    /// Accepts the config spellings (`rgb`, `rgb24`, `gray`, `yuyv`, `jpg`, `jpeg`, `mjpg`)
    pub fn parse(name: &str) -> HatResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rgb" | "rgb24" | "rgb8" => Ok(Self::Rgb),
            "gray" | "grey" | "mono8" => Ok(Self::Gray),
            "yuyv" | "yuv422" => Ok(Self::Yuyv),
            "jpg" | "jpeg" | "mjpg" | "mjpeg" => Ok(Self::Jpeg),
            other => Err(HatError::config(format!("unsupported image format '{}'", other))),
        }
    }

    /// Bytes per pixel for raw formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            Self::Rgb => Some(3),
            Self::Gray => Some(1),
            Self::Yuyv => Some(2),
            Self::Jpeg => None,
        }
    }

    /// Exact frame size for raw formats
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        self.bytes_per_pixel()
            .map(|bpp| width as usize * height as usize * bpp)
    }
}

/// One captured frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFrame {
    /// Set when the frame was flushed to its sink
    pub stamp_nanos: u64,
    /// Per-stream counter starting at 0
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub data: Vec<u8>,
}

impl ImageFrame {
    /// Row stride for raw formats
    pub fn step(&self) -> Option<usize> {
        self.format
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * bpp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        assert_eq!(ImageFormat::parse("JPG").unwrap(), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::parse("rgb24").unwrap(), ImageFormat::Rgb);
        assert!(ImageFormat::parse("bayer").is_err());
        assert_eq!(ImageFormat::Rgb.frame_size(4, 2), Some(24));
        assert_eq!(ImageFormat::Jpeg.frame_size(4, 2), None);
    }
}
