use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::BoundingBox;
use crate::error::FrameError;

/// Packed, row-major 8 bit image. Three channel images are BGR.
#[derive(Clone, PartialEq, Eq)]
pub struct FrameImage {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<u8>,
}

impl fmt::Debug for FrameImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl FrameImage {
    pub fn new(width: u32, height: u32, channels: u8, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * channels as usize;
        if !matches!(channels, 1 | 3) || data.len() != expected {
            return Err(FrameError::InvalidBuffer {
                width,
                height,
                channels,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn stride(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let c = self.channels as usize;
        let offset = y as usize * self.stride() + x as usize * c;
        Some(&self.data[offset..offset + c])
    }

    /// Copies the part of `region` that lies inside the image.
    pub fn crop(&self, region: &BoundingBox) -> Option<FrameImage> {
        let x0 = region.x.max(0) as u32;
        let y0 = region.y.max(0) as u32;
        let x1 = (region.x + region.width).clamp(0, self.width as i32) as u32;
        let y1 = (region.y + region.height).clamp(0, self.height as i32) as u32;
        if x0 >= x1 || y0 >= y1 {
            return None;
        }

        let c = self.channels as usize;
        let row_bytes = (x1 - x0) as usize * c;
        let mut data = Vec::with_capacity(row_bytes * (y1 - y0) as usize);
        for y in y0..y1 {
            let start = y as usize * self.stride() + x0 as usize * c;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Some(Self {
            width: x1 - x0,
            height: y1 - y0,
            channels: self.channels,
            data,
        })
    }

    /// Luma using the BT.601 weights; gray images are returned as is.
    pub fn to_gray(&self) -> FrameImage {
        if self.channels == 1 {
            return self.clone();
        }
        let data = self
            .data
            .chunks_exact(3)
            .map(|px| {
                let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
                ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8
            })
            .collect();
        Self {
            width: self.width,
            height: self.height,
            channels: 1,
            data,
        }
    }

    pub fn rotate(&self, rotation: Rotation) -> FrameImage {
        let (w, h) = (self.width as usize, self.height as usize);
        let (dst_w, dst_h) = match rotation {
            Rotation::None => return self.clone(),
            Rotation::Rotate180 => (w, h),
            Rotation::Clockwise90 | Rotation::Counterclockwise90 => (h, w),
        };

        let c = self.channels as usize;
        let mut data = vec![0u8; self.data.len()];
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = match rotation {
                    Rotation::Clockwise90 => (h - 1 - y, x),
                    Rotation::Rotate180 => (w - 1 - x, h - 1 - y),
                    Rotation::Counterclockwise90 => (y, w - 1 - x),
                    Rotation::None => (x, y),
                };
                let src = (y * w + x) * c;
                let dst = (dy * dst_w + dx) * c;
                data[dst..dst + c].copy_from_slice(&self.data[src..src + c]);
            }
        }
        Self {
            width: dst_w as u32,
            height: dst_h as u32,
            channels: self.channels,
            data,
        }
    }
}

/// Fixed camera rotation. `Clockwise90` is "90", `Counterclockwise90` is "270".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Rotate180,
    Counterclockwise90,
}

impl Rotation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rotation::None => "off",
            Rotation::Clockwise90 => "90",
            Rotation::Rotate180 => "180",
            Rotation::Counterclockwise90 => "270",
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rotation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "0" | "" => Ok(Rotation::None),
            "90" => Ok(Rotation::Clockwise90),
            "180" => Ok(Rotation::Rotate180),
            "270" | "-90" => Ok(Rotation::Counterclockwise90),
            other => Err(format!(
                "unsupported rotation '{other}', expected one of off, 90, 180, 270"
            )),
        }
    }
}

impl TryFrom<String> for Rotation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rotation> for String {
    fn from(value: Rotation) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub index: u64,
    pub timestamp: Duration,
    pub image: FrameImage,
    rotation: Rotation,
}

impl Frame {
    pub fn new(index: u64, timestamp: Duration, image: FrameImage) -> Self {
        Self {
            index,
            timestamp,
            image,
            rotation: Rotation::None,
        }
    }

    /// Rotation already applied to `image`.
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Applies `rotation` unless the frame has already been rotated.
    pub fn rotated(self, rotation: Rotation) -> Frame {
        if rotation == Rotation::None || self.rotation != Rotation::None {
            return self;
        }
        Self {
            image: self.image.rotate(rotation),
            rotation,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3x2 gray image:
    // 0 1 2
    // 3 4 5
    fn sample() -> FrameImage {
        FrameImage::new(3, 2, 1, vec![0, 1, 2, 3, 4, 5]).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let err = FrameImage::new(4, 4, 3, vec![0; 10]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidBuffer { actual: 10, .. }));
    }

    #[test]
    fn rotates_clockwise() {
        let rotated = sample().rotate(Rotation::Clockwise90);
        assert_eq!((rotated.width(), rotated.height()), (2, 3));
        assert_eq!(rotated.data(), &[3, 0, 4, 1, 5, 2]);
    }

    #[test]
    fn rotates_half_turn() {
        let rotated = sample().rotate(Rotation::Rotate180);
        assert_eq!((rotated.width(), rotated.height()), (3, 2));
        assert_eq!(rotated.data(), &[5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn rotates_counterclockwise() {
        let rotated = sample().rotate(Rotation::Counterclockwise90);
        assert_eq!((rotated.width(), rotated.height()), (2, 3));
        assert_eq!(rotated.data(), &[2, 5, 1, 4, 0, 3]);
    }

    #[test]
    fn colour_pixels_move_together() {
        let image = FrameImage::new(2, 1, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let rotated = image.rotate(Rotation::Rotate180);
        assert_eq!(rotated.pixel(0, 0), Some(&[4, 5, 6][..]));
        assert_eq!(rotated.pixel(1, 0), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn frame_rotation_is_not_reapplied() {
        let frame = Frame::new(0, Duration::ZERO, sample())
            .rotated(Rotation::Rotate180)
            .rotated(Rotation::Rotate180);
        assert_eq!(frame.rotation(), Rotation::Rotate180);
        assert_eq!(frame.image.data(), &[5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn crop_is_clamped_to_image() {
        let crop = sample()
            .crop(&BoundingBox::new(1, -4, 10, 10))
            .expect("overlapping region");
        assert_eq!((crop.width(), crop.height()), (2, 2));
        assert_eq!(crop.data(), &[1, 2, 4, 5]);

        assert!(sample().crop(&BoundingBox::new(5, 0, 2, 2)).is_none());
        assert!(sample().crop(&BoundingBox::new(0, 0, 0, 2)).is_none());
    }

    #[test]
    fn gray_conversion_uses_luma_weights() {
        let image = FrameImage::new(2, 1, 3, vec![0, 0, 255, 255, 255, 255]).unwrap();
        let gray = image.to_gray();
        assert_eq!(gray.channels(), 1);
        assert_eq!(gray.data(), &[76, 255]);
    }

    #[test]
    fn parses_rotation_settings() {
        assert_eq!("off".parse::<Rotation>().unwrap(), Rotation::None);
        assert_eq!("90".parse::<Rotation>().unwrap(), Rotation::Clockwise90);
        assert_eq!(" 180 ".parse::<Rotation>().unwrap(), Rotation::Rotate180);
        assert_eq!("270".parse::<Rotation>().unwrap(), Rotation::Counterclockwise90);
        assert!("45".parse::<Rotation>().is_err());
    }
}
