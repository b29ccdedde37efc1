//! Pulls frames from a source, runs detection and recognition on the sampled
//! ones and feeds the session tracker until the source ends or a budget stops
//! the run.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::metrics;
use crate::plate_detection::frame::{Frame, Rotation};
use crate::plate_detection::normalize::{AlphanumericNormalizer, PlateNormalizer};
use crate::plate_detection::video_reader::{FrameSource, Rotated};
use crate::plate_detection::{PlateDetector, PlateRecognizer};
use crate::progress::ProgressReporter;
use crate::session::{PlateSighting, RunSummary, SessionTracker, TrackerConfig};

const FALLBACK_FPS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Minimum recognition confidence, in `[0, 1]`.
    pub accuracy_threshold: f32,
    /// Process one frame, then skip this many.
    pub frame_skip: u32,
    pub session_timeout_frames: u64,
    pub rotation: Rotation,
    /// Wall clock budget for the whole run.
    pub max_duration: Option<Duration>,
    /// Bound on frames read from the source.
    pub max_frames: Option<u64>,
    pub detector_confidence_factor: f32,
    pub max_consecutive_frame_errors: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold: 0.75,
            frame_skip: 0,
            session_timeout_frames: 2,
            rotation: Rotation::None,
            max_duration: None,
            max_frames: None,
            detector_confidence_factor: 0.7,
            max_consecutive_frame_errors: 25,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.accuracy_threshold) {
            return Err(PipelineError::invalid_config(format!(
                "accuracy threshold {} is outside [0, 1]",
                self.accuracy_threshold
            )));
        }
        if self.session_timeout_frames == 0 {
            return Err(PipelineError::invalid_config(
                "session timeout must be at least one frame",
            ));
        }
        if self.max_frames == Some(0) {
            return Err(PipelineError::invalid_config(
                "frame budget must be at least one frame",
            ));
        }
        if !(self.detector_confidence_factor > 0.0 && self.detector_confidence_factor <= 1.0) {
            return Err(PipelineError::invalid_config(format!(
                "detector confidence factor {} is outside (0, 1]",
                self.detector_confidence_factor
            )));
        }
        if self.max_consecutive_frame_errors == 0 {
            return Err(PipelineError::invalid_config(
                "consecutive frame error limit must be at least 1",
            ));
        }
        Ok(())
    }

    /// Detections scoring below this never reach the recognizer.
    pub fn min_detection_confidence(&self) -> f32 {
        (self.accuracy_threshold * self.detector_confidence_factor).max(0.1)
    }

    pub fn is_sampled(&self, frame_index: u64) -> bool {
        frame_index % (self.frame_skip as u64 + 1) == 0
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            accuracy_threshold: self.accuracy_threshold,
            session_timeout_frames: self.session_timeout_frames,
        }
    }
}

/// Converts a time based session timeout to frames at `fps`, never below one.
pub fn timeout_frames_for(timeout: Duration, fps: f64) -> u64 {
    let fps = if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        FALLBACK_FPS
    };
    ((timeout.as_secs_f64() * fps).ceil() as u64).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    EndOfStream,
    Cancelled,
    MaxDuration,
    MaxFrames,
    /// Too many consecutive frames could not be decoded.
    SourceLost,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::EndOfStream => "end_of_stream",
            StopReason::Cancelled => "cancelled",
            StopReason::MaxDuration => "max_duration",
            StopReason::MaxFrames => "max_frames",
            StopReason::SourceLost => "source_lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub stop_reason: StopReason,
    pub frames_read: u64,
}

/// Shared stop flag, checked between frames.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Blocks until `input` yields a line, then cancels. End of input or a
    /// read error leave the token untouched.
    pub fn cancel_on_line(&self, mut input: impl BufRead) -> bool {
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(read) if read > 0 => {
                info!("stop requested from input");
                self.cancel();
                true
            }
            Ok(_) => false,
            Err(err) => {
                debug!("cancel input unreadable: {err}");
                false
            }
        }
    }
}

/// A snapshot goes out after `every_frames` processed frames or `every`
/// elapsed, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressCadence {
    pub every_frames: u64,
    pub every: Duration,
}

impl Default for ProgressCadence {
    fn default() -> Self {
        Self {
            every_frames: 50,
            every: Duration::from_secs(5),
        }
    }
}

pub struct DetectionPipeline<D, R> {
    detector: D,
    recognizer: R,
    normalizer: Box<dyn PlateNormalizer>,
    reporter: Option<Box<dyn ProgressReporter>>,
    cadence: ProgressCadence,
    cancel: CancellationToken,
}

impl<D: PlateDetector, R: PlateRecognizer> DetectionPipeline<D, R> {
    pub fn new(detector: D, recognizer: R) -> Self {
        Self {
            detector,
            recognizer,
            normalizer: Box::new(AlphanumericNormalizer::default()),
            reporter: None,
            cadence: ProgressCadence::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: impl PlateNormalizer + 'static) -> Self {
        self.normalizer = Box::new(normalizer);
        self
    }

    pub fn with_reporter(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    pub fn with_cadence(mut self, cadence: ProgressCadence) -> Self {
        self.cadence = ProgressCadence {
            every_frames: cadence.every_frames.max(1),
            ..cadence
        };
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn into_parts(self) -> (D, R) {
        (self.detector, self.recognizer)
    }

    pub fn run<S: FrameSource>(
        &mut self,
        source: S,
        config: &RunConfig,
    ) -> Result<RunReport, PipelineError> {
        config.validate()?;
        let started = Instant::now();
        let mut source = Rotated::new(source, config.rotation);

        let first = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(PipelineError::source_unavailable(
                    "source produced no frames",
                ))
            }
            Err(err) => {
                return Err(PipelineError::source_unavailable(format!(
                    "first frame unreadable: {err}"
                )))
            }
        };
        metrics::FRAMES_READ.inc();

        info!(
            "run started: {:.2} fps, threshold {:.2}, skip {}, timeout {} frames, rotation {}",
            source.effective_frame_rate(),
            config.accuracy_threshold,
            config.frame_skip,
            config.session_timeout_frames,
            config.rotation
        );

        let mut tracker = SessionTracker::new(config.tracker_config());
        let min_detection_confidence = config.min_detection_confidence();
        let mut pending = Some(first);
        let mut frames_read: u64 = 1;
        let mut consecutive_errors: u32 = 0;
        let mut processed_since_report: u64 = 0;
        let mut last_report = Instant::now();

        let stop_reason = loop {
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if config
                .max_duration
                .is_some_and(|budget| started.elapsed() >= budget)
            {
                break StopReason::MaxDuration;
            }

            let frame = match pending.take() {
                Some(frame) => frame,
                None => {
                    if config.max_frames.is_some_and(|budget| frames_read >= budget) {
                        break StopReason::MaxFrames;
                    }
                    match source.next_frame() {
                        Ok(Some(frame)) => {
                            frames_read += 1;
                            consecutive_errors = 0;
                            metrics::FRAMES_READ.inc();
                            frame
                        }
                        Ok(None) => break StopReason::EndOfStream,
                        Err(err) => {
                            frames_read += 1;
                            consecutive_errors += 1;
                            metrics::FRAME_ERRORS.inc();
                            warn!("skipping frame: {err}");
                            if consecutive_errors >= config.max_consecutive_frame_errors {
                                warn!(
                                    "{} consecutive unreadable frames, source lost",
                                    consecutive_errors
                                );
                                break StopReason::SourceLost;
                            }
                            continue;
                        }
                    }
                }
            };

            if !config.is_sampled(frame.index) {
                trace!("frame {} skipped by sampling", frame.index);
                continue;
            }

            self.process_frame(&frame, &mut tracker, min_detection_confidence);
            tracker.tick(frame.index, frame.timestamp);
            metrics::FRAMES_PROCESSED.inc();

            processed_since_report += 1;
            if let Some(reporter) = self.reporter.as_mut() {
                if processed_since_report >= self.cadence.every_frames
                    || last_report.elapsed() >= self.cadence.every
                {
                    reporter.on_progress(&tracker.snapshot());
                    processed_since_report = 0;
                    last_report = Instant::now();
                }
            }
        };

        let report = RunReport {
            summary: tracker.finalize(),
            stop_reason,
            frames_read,
        };
        metrics::RUNS.with_label_values(&[stop_reason.as_str()]).inc();
        info!(
            "run stopped ({}) after {} frames read in {:?}",
            stop_reason.as_str(),
            frames_read,
            report.summary.elapsed
        );
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.on_finished(&report);
        }
        Ok(report)
    }

    fn process_frame(&mut self, frame: &Frame, tracker: &mut SessionTracker, min_confidence: f32) {
        let detections = match self.detector.detect(frame) {
            Ok(detections) => detections,
            Err(err) => {
                metrics::INFERENCE_ERRORS
                    .with_label_values(&["detector"])
                    .inc();
                warn!("frame {}: {err}", frame.index);
                return;
            }
        };

        let mut readings: BTreeMap<String, f32> = BTreeMap::new();
        for detection in detections
            .iter()
            .filter(|detection| detection.confidence >= min_confidence)
        {
            let Some(crop) = frame.image.crop(&detection.region) else {
                debug!(
                    "frame {}: detection {:?} lies outside the frame",
                    frame.index, detection.region
                );
                continue;
            };
            let recognition = match self.recognizer.recognize(&crop) {
                Ok(Some(recognition)) => recognition,
                Ok(None) => continue,
                Err(err) => {
                    metrics::INFERENCE_ERRORS
                        .with_label_values(&["recognizer"])
                        .inc();
                    warn!("frame {}: {err}", frame.index);
                    continue;
                }
            };
            let Some(plate) = self.normalizer.normalize(&recognition.text) else {
                continue;
            };
            debug!(
                "frame {}: read {plate} ({:.2})",
                frame.index, recognition.confidence
            );
            let best = readings.entry(plate).or_insert(recognition.confidence);
            *best = best.max(recognition.confidence);
        }

        for (plate, confidence) in readings {
            tracker.ingest(PlateSighting::new(
                plate,
                confidence,
                frame.index,
                frame.timestamp,
            ));
        }
    }
}
