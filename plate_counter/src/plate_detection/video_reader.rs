use super::frame::{Frame, Rotation};
use crate::error::FrameError;

/// Ordered supply of frames: a video file or a live stream.
pub trait FrameSource {
    /// `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError>;

    fn effective_frame_rate(&self) -> f64;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        (**self).next_frame()
    }

    fn effective_frame_rate(&self) -> f64 {
        (**self).effective_frame_rate()
    }
}

/// Applies a fixed rotation to every frame before it leaves the source.
pub struct Rotated<S> {
    inner: S,
    rotation: Rotation,
}

impl<S: FrameSource> Rotated<S> {
    pub fn new(inner: S, rotation: Rotation) -> Self {
        Self { inner, rotation }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: FrameSource> FrameSource for Rotated<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let rotation = self.rotation;
        Ok(self.inner.next_frame()?.map(|frame| frame.rotated(rotation)))
    }

    fn effective_frame_rate(&self) -> f64 {
        self.inner.effective_frame_rate()
    }
}

#[cfg(feature = "opencv")]
pub use self::capture::VideoReader;

#[cfg(feature = "opencv")]
mod capture {
    use std::path::Path;
    use std::time::{Duration, Instant};

    use log::{info, warn};
    use opencv::core::{Vector, CV_8U};
    use opencv::imgproc::{cvt_color, COLOR_BGRA2BGR};
    use opencv::prelude::{
        Mat, MatTraitConst, MatTraitConstManual, VideoCaptureTrait, VideoCaptureTraitConst,
    };
    use opencv::videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_BUFFERSIZE, CAP_PROP_FPS, CAP_PROP_OPEN_TIMEOUT_MSEC,
        CAP_PROP_POS_MSEC, CAP_PROP_READ_TIMEOUT_MSEC,
    };

    use super::FrameSource;
    use crate::error::{FrameError, PipelineError};
    use crate::pacing::FpsLimiter;
    use crate::plate_detection::frame::{Frame, FrameImage};

    const FALLBACK_FPS: f64 = 30.0;

    /// OpenCV capture over a file path or a stream URI (rtsp, http, ...).
    pub struct VideoReader {
        capture: VideoCapture,
        fps: f64,
        next_index: u64,
        limiter: Option<FpsLimiter>,
    }

    impl VideoReader {
        pub fn open_file(path: &Path) -> Result<Self, PipelineError> {
            let location = path.to_string_lossy();
            let capture = VideoCapture::from_file(&location, CAP_ANY).map_err(|err| {
                PipelineError::source_unavailable(format!("cannot open {location}: {err}"))
            })?;
            if !capture.is_opened().unwrap_or(false) {
                return Err(PipelineError::source_unavailable(format!(
                    "could not open video file {location}"
                )));
            }
            Ok(Self::from_capture(capture, &location))
        }

        pub fn open_stream(uri: &str, connect_timeout: Duration) -> Result<Self, PipelineError> {
            let timeout_ms = connect_timeout.as_millis().min(i32::MAX as u128) as i32;
            let params = Vector::<i32>::from_slice(&[
                CAP_PROP_OPEN_TIMEOUT_MSEC,
                timeout_ms,
                CAP_PROP_READ_TIMEOUT_MSEC,
                timeout_ms,
            ]);

            let started = Instant::now();
            let mut capture = VideoCapture::from_file_with_params(uri, CAP_ANY, &params)
                .map_err(|err| {
                    PipelineError::source_unavailable(format!("cannot open {uri}: {err}"))
                })?;
            if !capture.is_opened().unwrap_or(false) {
                if started.elapsed() >= connect_timeout {
                    return Err(PipelineError::ConnectionTimeout {
                        uri: uri.to_string(),
                        timeout: connect_timeout,
                    });
                }
                return Err(PipelineError::source_unavailable(format!(
                    "could not open camera stream {uri}"
                )));
            }

            // Keep latency low on live streams.
            if let Err(err) = capture.set(CAP_PROP_BUFFERSIZE, 1.0) {
                warn!("could not shrink capture buffer for {uri}: {err}");
            }
            Ok(Self::from_capture(capture, uri))
        }

        /// Delivers frames no faster than the container frame rate.
        pub fn paced(mut self) -> Self {
            self.limiter = Some(FpsLimiter::new(self.fps));
            self
        }

        fn from_capture(capture: VideoCapture, location: &str) -> Self {
            let reported = capture.get(CAP_PROP_FPS).unwrap_or(0.0);
            let fps = if reported <= 0.0 || reported > 100.0 || !reported.is_finite() {
                FALLBACK_FPS
            } else {
                reported
            };
            info!("opened {location} at {fps:.2} fps (reported {reported:.2})");
            Self {
                capture,
                fps,
                next_index: 0,
                limiter: None,
            }
        }

        fn timestamp(&self, index: u64) -> Duration {
            match self.capture.get(CAP_PROP_POS_MSEC) {
                Ok(ms) if ms > 0.0 && ms.is_finite() => Duration::from_secs_f64(ms / 1000.0),
                _ => Duration::from_secs_f64(index as f64 / self.fps),
            }
        }
    }

    fn to_frame_image(mat: &Mat, index: u64) -> Result<FrameImage, FrameError> {
        let mut converted = Mat::default();
        let mat = if mat.channels() == 4 {
            cvt_color(mat, &mut converted, COLOR_BGRA2BGR, 0)
                .map_err(|err| FrameError::decode(index, err))?;
            &converted
        } else {
            mat
        };
        if mat.depth() != CV_8U {
            return Err(FrameError::decode(index, "only 8 bit frames are supported"));
        }

        let owned;
        let mat = if mat.is_continuous() {
            mat
        } else {
            owned = mat.try_clone().map_err(|err| FrameError::decode(index, err))?;
            &owned
        };
        let bytes = mat
            .data_bytes()
            .map_err(|err| FrameError::decode(index, err))?;
        FrameImage::new(
            mat.cols() as u32,
            mat.rows() as u32,
            mat.channels() as u8,
            bytes.to_vec(),
        )
    }

    impl FrameSource for VideoReader {
        fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
            if let Some(limiter) = self.limiter.as_mut() {
                limiter.wait();
            }

            let index = self.next_index;
            self.next_index += 1;

            let mut image = Mat::default();
            let grabbed = self
                .capture
                .read(&mut image)
                .map_err(|err| FrameError::decode(index, err))?;
            if !grabbed || image.empty() {
                return Ok(None);
            }

            let timestamp = self.timestamp(index);
            let image = to_frame_image(&image, index)?;
            Ok(Some(Frame::new(index, timestamp, image)))
        }

        fn effective_frame_rate(&self) -> f64 {
            self.fps
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::plate_detection::frame::FrameImage;

    struct Counting(u64);

    impl FrameSource for Counting {
        fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
            if self.0 == 2 {
                return Ok(None);
            }
            let image = FrameImage::new(2, 1, 1, vec![10, 20]).unwrap();
            let frame = Frame::new(self.0, Duration::ZERO, image);
            self.0 += 1;
            Ok(Some(frame))
        }

        fn effective_frame_rate(&self) -> f64 {
            12.5
        }
    }

    #[test]
    fn rotated_source_rotates_each_frame_once() {
        let inner = Rotated::new(Counting(0), Rotation::Rotate180);
        let mut source = Rotated::new(inner, Rotation::Rotate180);
        assert_eq!(source.effective_frame_rate(), 12.5);

        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.rotation(), Rotation::Rotate180);
        assert_eq!(frame.image.data(), &[20, 10]);
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
    }
}
