use std::ffi::CString;
use std::path::Path;

use leptess::tesseract::TessApi;
use log::{debug, info};

use super::frame::FrameImage;
use super::{BoundingBox, PlateRecognizer, Recognition};
use crate::error::InferenceError;

const PLATE_CHARACTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
// Single text line.
const PAGE_SEGMENTATION_MODE: &str = "7";

/// Tesseract reader for cropped plates.
pub struct DnnOcrReader {
    ocr: TessApi,
}

impl DnnOcrReader {
    /// `data_path` is the tessdata directory, `None` for the system default.
    pub fn new(data_path: Option<&Path>, language: &str) -> Result<Self, InferenceError> {
        let location = data_path.map(|p| p.to_string_lossy().into_owned());
        let load_error = |reason: String| InferenceError::ModelLoad {
            path: data_path.map(Path::to_path_buf).unwrap_or_default(),
            reason,
        };

        let mut api = TessApi::new(location.as_deref(), language)
            .map_err(|err| load_error(format!("{err:?}")))?;
        set_variable(&mut api, "tessedit_char_whitelist", PLATE_CHARACTERS).map_err(load_error)?;
        set_variable(&mut api, "tessedit_pageseg_mode", PAGE_SEGMENTATION_MODE)
            .map_err(load_error)?;
        info!(
            "loaded tesseract language {language} from {}",
            location.as_deref().unwrap_or("the default tessdata")
        );

        Ok(Self { ocr: api })
    }

    /// Drops the plate frame and mounting screws around the characters.
    fn reshape_plate(plate: &FrameImage) -> Option<FrameImage> {
        let (width, height) = (plate.width() as f32, plate.height() as f32);
        let inner = BoundingBox::new(
            (width * 0.10) as i32,
            (height * 0.12) as i32,
            plate.width() as i32 - (width * 0.12) as i32,
            plate.height() as i32 - (height * 0.24) as i32,
        );
        plate.to_gray().crop(&inner)
    }
}

fn set_variable(api: &mut TessApi, name: &str, value: &str) -> Result<(), String> {
    let name_c = CString::new(name).map_err(|err| err.to_string())?;
    let value_c = CString::new(value).map_err(|err| err.to_string())?;
    api.raw
        .set_variable(&name_c, &value_c)
        .map_err(|err| format!("setting {name}: {err:?}"))
}

impl PlateRecognizer for DnnOcrReader {
    fn recognize(&mut self, plate: &FrameImage) -> Result<Option<Recognition>, InferenceError> {
        let Some(cropped) = Self::reshape_plate(plate) else {
            return Err(InferenceError::recognizer("plate crop is empty"));
        };

        let cols = cropped.width() as i32;
        let rows = cropped.height() as i32;
        self.ocr
            .raw
            .set_image(cropped.data(), cols, rows, 1, cols)
            .map_err(|err| InferenceError::recognizer(format!("{err:?}")))?;
        let text = self
            .ocr
            .get_utf8_text()
            .map_err(InferenceError::recognizer)?;
        let confidence = (self.ocr.mean_text_conf() as f32 / 100.0).clamp(0.0, 1.0);

        let text = text.trim();
        debug!("ocr read {text:?} ({confidence:.2}) from {cols}x{rows}");
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(Recognition::new(text, confidence)))
    }
}
