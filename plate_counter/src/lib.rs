//! Counts distinct license plate sightings in video files and camera streams.

pub mod counters;
pub mod error;
pub mod metrics;
pub mod mock;
pub mod pacing;
pub mod pipeline;
pub mod plate_detection;
pub mod progress;
pub mod session;
pub mod settings;

pub use counters::{CounterStore, InMemoryCounters, JsonFileCounters};
pub use error::{FrameError, InferenceError, PipelineError, StoreError};
pub use pipeline::{
    CancellationToken, DetectionPipeline, ProgressCadence, RunConfig, RunReport, StopReason,
};
pub use plate_detection::frame::{Frame, FrameImage, Rotation};
pub use plate_detection::video_reader::FrameSource;
pub use session::{PlateSighting, RunSummary, SessionTracker, TrackerConfig, TrackerSnapshot};
