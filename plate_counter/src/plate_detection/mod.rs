pub mod frame;
pub mod normalize;
pub mod video_reader;

#[cfg(feature = "tesseract")]
pub mod dnn_ocr;
#[cfg(feature = "opencv")]
pub mod object_detector;

use crate::error::InferenceError;
use frame::{Frame, FrameImage};

/// Axis aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub region: BoundingBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(region: BoundingBox, confidence: f32) -> Self {
        Self { region, confidence }
    }
}

/// Text read from one plate crop, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
}

impl Recognition {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Finds plate regions in a frame.
pub trait PlateDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;
}

/// Reads the characters of a cropped plate. `Ok(None)` means nothing legible.
pub trait PlateRecognizer {
    fn recognize(&mut self, plate: &FrameImage) -> Result<Option<Recognition>, InferenceError>;
}

impl<T: PlateDetector + ?Sized> PlateDetector for &mut T {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        (**self).detect(frame)
    }
}

impl<T: PlateDetector + ?Sized> PlateDetector for Box<T> {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        (**self).detect(frame)
    }
}

impl<T: PlateRecognizer + ?Sized> PlateRecognizer for &mut T {
    fn recognize(&mut self, plate: &FrameImage) -> Result<Option<Recognition>, InferenceError> {
        (**self).recognize(plate)
    }
}

impl<T: PlateRecognizer + ?Sized> PlateRecognizer for Box<T> {
    fn recognize(&mut self, plate: &FrameImage) -> Result<Option<Recognition>, InferenceError> {
        (**self).recognize(plate)
    }
}
