use std::path::Path;

use log::{debug, info};
use opencv::core::{Rect, Scalar, Size, Vector, CV_32F, CV_8UC1, CV_8UC3};
use opencv::dnn::{
    blob_from_image, nms_boxes, read_net_from_onnx, Net, DNN_BACKEND_CUDA, DNN_BACKEND_OPENCV,
    DNN_TARGET_CPU, DNN_TARGET_CUDA,
};
use opencv::imgproc::{cvt_color, COLOR_GRAY2BGR};
use opencv::prelude::{Mat, MatTraitConst, MatTraitManual, NetTrait, NetTraitConst};

use super::frame::{Frame, FrameImage};
use super::{BoundingBox, Detection, PlateDetector};
use crate::error::InferenceError;

#[derive(Debug, Clone, Copy)]
pub struct DetectorOptions {
    pub use_gpu: bool,
    /// Network input side, in pixels.
    pub input_size: i32,
    /// Rows in the YOLOv5 output tensor.
    pub proposals: i32,
    pub objectness_threshold: f32,
    pub class_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            use_gpu: false,
            input_size: 640,
            proposals: 25200,
            objectness_threshold: 0.4,
            class_threshold: 0.25,
            nms_threshold: 0.4,
        }
    }
}

/// Single class YOLOv5 plate model run through the OpenCV DNN module.
pub struct YoloPlateDetector {
    classifier: Net,
    options: DetectorOptions,
}

impl YoloPlateDetector {
    pub fn load(model: &Path, options: DetectorOptions) -> Result<Self, InferenceError> {
        let load_error = |reason: opencv::Error| InferenceError::ModelLoad {
            path: model.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut classifier = read_net_from_onnx(&model.to_string_lossy()).map_err(load_error)?;
        if options.use_gpu {
            classifier
                .set_preferable_backend(DNN_BACKEND_CUDA)
                .map_err(load_error)?;
            classifier
                .set_preferable_target(DNN_TARGET_CUDA)
                .map_err(load_error)?;
        } else {
            classifier
                .set_preferable_backend(DNN_BACKEND_OPENCV)
                .map_err(load_error)?;
            classifier
                .set_preferable_target(DNN_TARGET_CPU)
                .map_err(load_error)?;
        }
        info!(
            "loaded plate detector {} ({})",
            model.display(),
            if options.use_gpu { "cuda" } else { "cpu" }
        );

        Ok(Self {
            classifier,
            options,
        })
    }

    fn post_process(
        &self,
        img_rows: i32,
        img_cols: i32,
        outputs: &Vector<Mat>,
    ) -> opencv::Result<Vec<Detection>> {
        let mut confidences = Vector::<f32>::default();
        let mut boxes = Vector::<Rect>::default();

        let x_factor = img_cols as f32 / self.options.input_size as f32;
        let y_factor = img_rows as f32 / self.options.input_size as f32;

        for data in outputs {
            for j in 0..self.options.proposals {
                let confidence: f32 = *data.at_3d(0, j, 4)?;
                if confidence <= self.options.objectness_threshold {
                    continue;
                }
                let class_score: f32 = *data.at_3d(0, j, 5)?;
                if class_score <= self.options.class_threshold {
                    continue;
                }
                let cx: f32 = *data.at_3d(0, j, 0)?;
                let cy: f32 = *data.at_3d(0, j, 1)?;
                let w: f32 = *data.at_3d(0, j, 2)?;
                let h: f32 = *data.at_3d(0, j, 3)?;
                let left = (cx - 0.5 * w) * x_factor;
                let top = (cy - 0.5 * h) * y_factor;

                confidences.push(confidence);
                boxes.push(Rect::new(
                    left as i32,
                    top as i32,
                    (w * x_factor) as i32,
                    (h * y_factor) as i32,
                ));
            }
        }

        let mut indices = Vector::<i32>::default();
        nms_boxes(
            &boxes,
            &confidences,
            self.options.objectness_threshold,
            self.options.nms_threshold,
            &mut indices,
            1.0,
            0,
        )?;

        let mut detections = Vec::with_capacity(indices.len());
        for i in indices {
            let rect = boxes.get(i as usize)?;
            let confidence = confidences.get(i as usize)?;
            detections.push(Detection::new(
                BoundingBox::new(rect.x, rect.y, rect.width, rect.height),
                confidence.clamp(0.0, 1.0),
            ));
        }
        Ok(detections)
    }

    fn infer(&mut self, image: &FrameImage) -> opencv::Result<Vec<Detection>> {
        let mat = to_bgr_mat(image)?;
        let mut blob = blob_from_image(
            &mat,
            1.0 / 255.0,
            Size::new(self.options.input_size, self.options.input_size),
            Scalar::default(),
            true,
            false,
            CV_32F,
        )?;

        self.classifier
            .set_input(&mut blob, "", 1.0, Scalar::default())?;
        let output_names = self.classifier.get_unconnected_out_layers_names()?;
        let mut output_values = Vector::<Mat>::default();
        self.classifier.forward(&mut output_values, &output_names)?;

        self.post_process(mat.rows(), mat.cols(), &output_values)
    }
}

fn to_bgr_mat(image: &FrameImage) -> opencv::Result<Mat> {
    let typ = if image.channels() == 1 { CV_8UC1 } else { CV_8UC3 };
    let mut mat = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        typ,
        Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(image.data());
    if image.channels() == 3 {
        return Ok(mat);
    }
    let mut bgr = Mat::default();
    cvt_color(&mat, &mut bgr, COLOR_GRAY2BGR, 0)?;
    Ok(bgr)
}

impl PlateDetector for YoloPlateDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let detections = self.infer(&frame.image).map_err(InferenceError::detector)?;
        debug!("frame {}: {} plate regions", frame.index, detections.len());
        Ok(detections)
    }
}
