//! Scripted frame source and models, for tests and demos without native
//! backends.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{FrameError, InferenceError};
use crate::pacing::FpsLimiter;
use crate::pipeline::CancellationToken;
use crate::plate_detection::frame::{Frame, FrameImage};
use crate::plate_detection::video_reader::FrameSource;
use crate::plate_detection::{
    BoundingBox, Detection, PlateDetector, PlateRecognizer, Recognition,
};

/// Width of the region reserved for each scripted plate; plate `n` of a frame
/// is placed at `x = n * SLOT_WIDTH`.
pub const SLOT_WIDTH: i32 = 8;
const SLOT_HEIGHT: i32 = 4;

/// Synthetic gray frames where pixel `(x, y)` holds `(x + y * width) % 256`.
pub struct ScriptedSource {
    frames: u64,
    width: u32,
    height: u32,
    fps: f64,
    next: u64,
    failures: BTreeSet<u64>,
    unreachable: bool,
    limiter: Option<FpsLimiter>,
}

impl ScriptedSource {
    pub fn new(frames: u64, width: u32, height: u32) -> Self {
        Self {
            frames,
            width,
            height,
            fps: 25.0,
            next: 0,
            failures: BTreeSet::new(),
            unreachable: false,
            limiter: None,
        }
    }

    /// A source that ends before its first frame.
    pub fn empty() -> Self {
        Self::new(0, 1, 1)
    }

    /// A source whose every read fails.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new(0, 1, 1)
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    /// Frames at these indices fail to decode.
    pub fn failing_at(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.failures.extend(indices);
        self
    }

    pub fn paced(mut self) -> Self {
        self.limiter = Some(FpsLimiter::new(self.fps));
        self
    }

    fn image(&self) -> Result<FrameImage, FrameError> {
        let (w, h) = (self.width as usize, self.height as usize);
        let data = (0..w * h).map(|i| (i % 256) as u8).collect();
        FrameImage::new(self.width, self.height, 1, data)
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.unreachable {
            return Err(FrameError::decode(self.next, "connection refused"));
        }
        if self.next >= self.frames {
            return Ok(None);
        }
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.wait();
        }

        let index = self.next;
        self.next += 1;
        if self.failures.contains(&index) {
            return Err(FrameError::decode(index, "scripted corruption"));
        }

        let timestamp = Duration::from_secs_f64(index as f64 / self.fps);
        Ok(Some(Frame::new(index, timestamp, self.image()?)))
    }

    fn effective_frame_rate(&self) -> f64 {
        self.fps
    }
}

/// What the scripted detector and recognizer report, frame by frame.
pub struct PlateScript {
    readings: BTreeMap<u64, Vec<(String, f32)>>,
    detector_failures: BTreeSet<u64>,
    recognizer_failures: BTreeSet<(u64, usize)>,
    cancel_on: Option<(u64, CancellationToken)>,
    detection_confidence: f32,
}

impl Default for PlateScript {
    fn default() -> Self {
        Self {
            readings: BTreeMap::new(),
            detector_failures: BTreeSet::new(),
            recognizer_failures: BTreeSet::new(),
            cancel_on: None,
            detection_confidence: 0.9,
        }
    }
}

impl PlateScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one plate reading on `frame`, in the next free slot.
    pub fn plate(mut self, frame: u64, text: &str, confidence: f32) -> Self {
        self.readings
            .entry(frame)
            .or_default()
            .push((text.to_string(), confidence));
        self
    }

    pub fn plates(
        mut self,
        frames: impl IntoIterator<Item = u64>,
        text: &str,
        confidence: f32,
    ) -> Self {
        for frame in frames {
            self = self.plate(frame, text, confidence);
        }
        self
    }

    pub fn detector_fails(mut self, frame: u64) -> Self {
        self.detector_failures.insert(frame);
        self
    }

    pub fn recognizer_fails(mut self, frame: u64, slot: usize) -> Self {
        self.recognizer_failures.insert((frame, slot));
        self
    }

    /// Cancels `token` while `frame` is being detected.
    pub fn cancel_on(mut self, frame: u64, token: CancellationToken) -> Self {
        self.cancel_on = Some((frame, token));
        self
    }

    /// Score attached to every scripted detection.
    pub fn detection_confidence(mut self, confidence: f32) -> Self {
        self.detection_confidence = confidence;
        self
    }
}

/// Frame as observed by the scripted detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenFrame {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub first_pixel: u8,
}

/// Crop as observed by the scripted recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenCrop {
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub first_pixel: u8,
}

struct ScriptState {
    script: PlateScript,
    // (frame, slot, text, confidence) waiting for the recognizer
    queue: VecDeque<(u64, usize, String, f32)>,
    frames: Vec<SeenFrame>,
    crops: Vec<SeenCrop>,
}

#[derive(Clone)]
pub struct ScriptHandle(Arc<Mutex<ScriptState>>);

impl ScriptHandle {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seen_frames(&self) -> Vec<SeenFrame> {
        self.lock().frames.clone()
    }

    pub fn detected_indices(&self) -> Vec<u64> {
        self.lock().frames.iter().map(|frame| frame.index).collect()
    }

    pub fn seen_crops(&self) -> Vec<SeenCrop> {
        self.lock().crops.clone()
    }
}

pub struct ScriptedDetector(ScriptHandle);

pub struct ScriptedRecognizer(ScriptHandle);

/// Builds a detector/recognizer pair playing back `script`, plus a handle to
/// inspect what they were shown.
pub fn scripted(script: PlateScript) -> (ScriptedDetector, ScriptedRecognizer, ScriptHandle) {
    let handle = ScriptHandle(Arc::new(Mutex::new(ScriptState {
        script,
        queue: VecDeque::new(),
        frames: Vec::new(),
        crops: Vec::new(),
    })));
    (
        ScriptedDetector(handle.clone()),
        ScriptedRecognizer(handle.clone()),
        handle,
    )
}

impl PlateDetector for ScriptedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let mut state = self.0.lock();
        state.queue.clear();
        state.frames.push(SeenFrame {
            index: frame.index,
            width: frame.image.width(),
            height: frame.image.height(),
            first_pixel: frame.image.data().first().copied().unwrap_or(0),
        });

        if let Some((at, token)) = &state.script.cancel_on {
            if *at == frame.index {
                token.cancel();
            }
        }
        if state.script.detector_failures.contains(&frame.index) {
            return Err(InferenceError::detector("scripted detector failure"));
        }

        let confidence = state.script.detection_confidence;
        let readings = state
            .script
            .readings
            .get(&frame.index)
            .cloned()
            .unwrap_or_default();

        let mut detections = Vec::with_capacity(readings.len());
        for (slot, (text, reading_confidence)) in readings.into_iter().enumerate() {
            let region = BoundingBox::new(slot as i32 * SLOT_WIDTH, 0, SLOT_WIDTH, SLOT_HEIGHT);
            detections.push(Detection::new(region, confidence));
            state
                .queue
                .push_back((frame.index, slot, text, reading_confidence));
        }
        Ok(detections)
    }
}

impl PlateRecognizer for ScriptedRecognizer {
    fn recognize(&mut self, plate: &FrameImage) -> Result<Option<Recognition>, InferenceError> {
        let mut state = self.0.lock();
        let Some((frame_index, slot, text, confidence)) = state.queue.pop_front() else {
            return Ok(None);
        };
        state.crops.push(SeenCrop {
            frame_index,
            width: plate.width(),
            height: plate.height(),
            first_pixel: plate.data().first().copied().unwrap_or(0),
        });

        if state.script.recognizer_failures.contains(&(frame_index, slot)) {
            return Err(InferenceError::recognizer("scripted recognizer failure"));
        }
        Ok(Some(Recognition::new(text, confidence)))
    }
}
