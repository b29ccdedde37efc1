//! Process wide settings: command line flags, each with an environment
//! variable fallback.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::error::PipelineError;
use crate::pipeline::{timeout_frames_for, RunConfig};
use crate::plate_detection::frame::Rotation;
use crate::plate_detection::normalize::{
    AlphanumericNormalizer, PlateFormatFilter, PlateNormalizer,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum PlateFormat {
    /// Any alphanumeric reading.
    Any,
    /// Only readings matching Uzbek plate formats.
    Uzbek,
}

#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// YOLOv5 plate detection model (ONNX).
    #[arg(long, env = "DETECTION_MODEL_PATH", default_value = "models/plate_yolov5.onnx")]
    pub detection_model: PathBuf,

    /// Tesseract data directory; the system default when unset.
    #[arg(long, env = "RECOGNITION_MODEL_PATH")]
    pub recognition_model: Option<PathBuf>,

    #[arg(long, env = "TESSERACT_LANGUAGE", default_value = "eng")]
    pub tesseract_language: String,

    /// Minimum recognition confidence, in percent.
    #[arg(long, env = "DEFAULT_ACCURACY", default_value_t = 75,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    pub accuracy: u8,

    /// Frames skipped after each processed frame.
    #[arg(long, env = "FRAME_SKIP", default_value_t = 0)]
    pub frame_skip: u32,

    /// Session timeout for video files, in frames.
    #[arg(long, env = "SESSION_TIMEOUT_FRAMES", default_value_t = 2,
          value_parser = clap::value_parser!(u64).range(1..))]
    pub session_timeout_frames: u64,

    /// Session timeout for camera streams, in seconds.
    #[arg(long, env = "CAMERA_SESSION_TIMEOUT_SECONDS", default_value_t = 5.0)]
    pub camera_session_timeout: f64,

    /// How long a camera stream is watched when no duration is given, in seconds.
    #[arg(long, env = "DEFAULT_CAMERA_DURATION_SECONDS", default_value_t = 60)]
    pub camera_duration: u64,

    /// Give up on a camera stream that does not connect within this many seconds.
    #[arg(long, env = "CAMERA_CONNECT_TIMEOUT_SECONDS", default_value_t = 10)]
    pub camera_connect_timeout: u64,

    /// Camera rotation: off, 90, 180 or 270.
    #[arg(long, env = "CAMERA_ROTATION", default_value = "off")]
    pub camera_rotation: Rotation,

    /// Detections below accuracy times this factor skip recognition.
    #[arg(long, env = "CAMERA_CONFIDENCE_FACTOR", default_value_t = 0.7)]
    pub confidence_factor: f32,

    /// Per plate counters, kept across runs.
    #[arg(long, env = "STORAGE_FILE_PATH", default_value = "data/license_plates.json")]
    pub storage_file: PathBuf,

    /// Larger video files are refused.
    #[arg(long, env = "MAX_VIDEO_SIZE_MB", default_value_t = 20)]
    pub max_video_size_mb: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Run the detector on CUDA.
    #[arg(long, env = "USE_GPU")]
    pub use_gpu: bool,

    #[arg(long, env = "PLATE_FORMAT", value_enum, default_value_t = PlateFormat::Any)]
    pub plate_format: PlateFormat,

    /// Pyroscope server for continuous profiling.
    #[arg(long, env = "PYROSCOPE_URL")]
    pub pyroscope_url: Option<String>,
}

impl Settings {
    pub fn accuracy_threshold(&self) -> f32 {
        f32::from(self.accuracy) / 100.0
    }

    pub fn video_run_config(&self) -> RunConfig {
        RunConfig {
            accuracy_threshold: self.accuracy_threshold(),
            frame_skip: self.frame_skip,
            session_timeout_frames: self.session_timeout_frames,
            detector_confidence_factor: self.confidence_factor,
            ..RunConfig::default()
        }
    }

    /// `fps` is the stream's effective rate, used to express the session
    /// timeout in frames.
    pub fn camera_run_config(
        &self,
        fps: f64,
        duration: Option<Duration>,
    ) -> Result<RunConfig, PipelineError> {
        let timeout = self.camera_session_timeout()?;
        Ok(RunConfig {
            accuracy_threshold: self.accuracy_threshold(),
            frame_skip: self.frame_skip,
            session_timeout_frames: timeout_frames_for(timeout, fps),
            rotation: self.camera_rotation,
            max_duration: Some(duration.unwrap_or(self.default_camera_duration())),
            detector_confidence_factor: self.confidence_factor,
            ..RunConfig::default()
        })
    }

    pub fn camera_session_timeout(&self) -> Result<Duration, PipelineError> {
        Duration::try_from_secs_f64(self.camera_session_timeout).map_err(|err| {
            PipelineError::invalid_config(format!(
                "camera session timeout {}: {err}",
                self.camera_session_timeout
            ))
        })
    }

    pub fn default_camera_duration(&self) -> Duration {
        Duration::from_secs(self.camera_duration)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.camera_connect_timeout)
    }

    pub fn normalizer(&self) -> Box<dyn PlateNormalizer> {
        match self.plate_format {
            PlateFormat::Any => Box::new(AlphanumericNormalizer::default()),
            PlateFormat::Uzbek => Box::new(PlateFormatFilter::uzbek()),
        }
    }

    pub fn max_video_bytes(&self) -> u64 {
        self.max_video_size_mb.saturating_mul(1024 * 1024)
    }

    /// The effective values a run would use, in display order.
    pub fn status_lines(&self) -> Vec<(&'static str, String)> {
        let camera_timeout = match self.camera_session_timeout() {
            Ok(timeout) => format!("{:.1}s", timeout.as_secs_f64()),
            Err(err) => format!("invalid ({err})"),
        };
        let plate_format = match self.plate_format {
            PlateFormat::Any => "any",
            PlateFormat::Uzbek => "uzbek",
        };
        vec![
            ("accuracy", format!("{}%", self.accuracy)),
            ("frame skip", self.frame_skip.to_string()),
            (
                "video session timeout",
                format!("{} frames", self.session_timeout_frames),
            ),
            ("camera session timeout", camera_timeout),
            (
                "camera duration",
                format!("{}s", self.default_camera_duration().as_secs()),
            ),
            ("camera rotation", self.camera_rotation.to_string()),
            ("confidence factor", format!("{:.2}", self.confidence_factor)),
            ("plate format", plate_format.to_string()),
            ("max video size", format!("{} MB", self.max_video_size_mb)),
            ("storage file", self.storage_file.display().to_string()),
        ]
    }

    /// Returns the file size, or refuses files above the configured limit.
    pub fn ensure_within_size_limit(&self, path: &Path) -> Result<u64, PipelineError> {
        let bytes = fs::metadata(path)
            .map_err(|err| {
                PipelineError::source_unavailable(format!("{}: {err}", path.display()))
            })?
            .len();
        let limit = self.max_video_bytes();
        if bytes > limit {
            return Err(PipelineError::SourceTooLarge {
                path: path.to_path_buf(),
                bytes,
                limit,
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        settings: Settings,
    }

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["plate_counter"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().settings
    }

    #[test]
    fn video_config_uses_frame_timeout() {
        let settings = parse(&[
            "--accuracy",
            "80",
            "--frame-skip",
            "2",
            "--session-timeout-frames",
            "4",
        ]);
        let config = settings.video_run_config();
        assert_eq!(config.accuracy_threshold, 0.8);
        assert_eq!(config.frame_skip, 2);
        assert_eq!(config.session_timeout_frames, 4);
        assert_eq!(config.rotation, Rotation::None);
        assert_eq!(config.max_duration, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn camera_config_converts_seconds_to_frames() {
        let settings = parse(&[
            "--camera-session-timeout",
            "2",
            "--camera-rotation",
            "270",
            "--camera-duration",
            "30",
        ]);
        let config = settings.camera_run_config(12.5, None).unwrap();
        assert_eq!(config.session_timeout_frames, 25);
        assert_eq!(config.rotation, Rotation::Counterclockwise90);
        assert_eq!(config.max_duration, Some(Duration::from_secs(30)));

        let config = settings
            .camera_run_config(12.5, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(config.max_duration, Some(Duration::from_secs(5)));
    }

    #[test]
    fn unrepresentable_camera_timeout_is_a_config_error() {
        for value in ["inf", "NaN", "1e300", "-1"] {
            let settings = parse(&[&format!("--camera-session-timeout={value}")]);
            assert!(
                matches!(
                    settings.camera_run_config(25.0, None),
                    Err(PipelineError::InvalidConfig(_))
                ),
                "{value}"
            );
        }
    }

    #[test]
    fn status_reports_effective_values() {
        let settings = parse(&[
            "--accuracy",
            "60",
            "--camera-rotation",
            "90",
            "--camera-session-timeout",
            "2.5",
        ]);
        let status = settings.status_lines();
        let value = |key: &str| {
            status
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(value("accuracy"), Some("60%"));
        assert_eq!(value("frame skip"), Some("0"));
        assert_eq!(value("video session timeout"), Some("2 frames"));
        assert_eq!(value("camera session timeout"), Some("2.5s"));
        assert_eq!(value("camera duration"), Some("60s"));
        assert_eq!(value("camera rotation"), Some("90"));
        assert_eq!(value("plate format"), Some("any"));

        let broken = parse(&["--camera-session-timeout", "inf"]);
        assert!(broken.status_lines()[3].1.starts_with("invalid"));
    }

    #[test]
    fn rejects_bad_values() {
        let mut argv = vec!["plate_counter", "--accuracy", "150"];
        assert!(TestCli::try_parse_from(&argv).is_err());
        argv = vec!["plate_counter", "--camera-rotation", "45"];
        assert!(TestCli::try_parse_from(&argv).is_err());
        argv = vec!["plate_counter", "--session-timeout-frames", "0"];
        assert!(TestCli::try_parse_from(&argv).is_err());
    }

    #[test]
    fn selects_plate_grammar() {
        let any = parse(&[]).normalizer();
        assert_eq!(any.normalize("abc").as_deref(), Some("ABC"));

        let uzbek = parse(&["--plate-format", "uzbek"]).normalizer();
        assert_eq!(uzbek.normalize("abc"), None);
        assert_eq!(uzbek.normalize("01 a 123 bc").as_deref(), Some("01A123BC"));
    }

    #[test]
    fn refuses_oversized_video() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        fs::write(&path, vec![0u8; 2 * 1024 * 1024]).unwrap();

        let settings = parse(&["--max-video-size-mb", "1"]);
        assert!(matches!(
            settings.ensure_within_size_limit(&path),
            Err(PipelineError::SourceTooLarge { bytes, .. }) if bytes == 2 * 1024 * 1024
        ));

        let settings = parse(&["--max-video-size-mb", "2"]);
        assert_eq!(settings.ensure_within_size_limit(&path).unwrap(), 2 * 1024 * 1024);
        assert!(settings
            .ensure_within_size_limit(&dir.path().join("missing.mp4"))
            .is_err());
    }
}
