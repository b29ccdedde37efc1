//! Deduplication of plate sightings into counted sessions.
//!
//! A session is one continuous episode of a plate being visible. It stays open
//! while sightings keep arriving within `session_timeout_frames` of each other
//! and is counted exactly once, when it closes.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{info, trace, warn};
use serde::Serialize;

use crate::metrics;

/// One normalized plate reading, ready for the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateSighting {
    pub plate_text: String,
    pub confidence: f32,
    pub frame_index: u64,
    pub timestamp: Duration,
}

impl PlateSighting {
    pub fn new(
        plate_text: impl Into<String>,
        confidence: f32,
        frame_index: u64,
        timestamp: Duration,
    ) -> Self {
        Self {
            plate_text: plate_text.into(),
            confidence,
            frame_index,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerConfig {
    pub accuracy_threshold: f32,
    pub session_timeout_frames: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub plate_text: String,
    pub first_frame_index: u64,
    pub last_frame_index: u64,
    pub last_timestamp: Duration,
    pub is_open: bool,
    /// Distinct frames the plate was read in.
    pub sightings: u32,
    pub best_confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub counts: BTreeMap<String, u64>,
    pub open_plates: Vec<String>,
    pub last_frame_index: Option<u64>,
    pub frames_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub counts: BTreeMap<String, u64>,
    pub total_frames_processed: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total_sessions(&self) -> u64 {
        self.counts.values().sum()
    }
}

pub struct SessionTracker {
    config: TrackerConfig,
    open: BTreeMap<String, Session>,
    counts: BTreeMap<String, u64>,
    last_frame_index: Option<u64>,
    frames_processed: u64,
    started: Instant,
    summary: Option<RunSummary>,
}

impl SessionTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config: TrackerConfig {
                session_timeout_frames: config.session_timeout_frames.max(1),
                ..config
            },
            open: BTreeMap::new(),
            counts: BTreeMap::new(),
            last_frame_index: None,
            frames_processed: 0,
            started: Instant::now(),
            summary: None,
        }
    }

    /// Returns whether the sighting was accepted.
    pub fn ingest(&mut self, event: PlateSighting) -> bool {
        if self.summary.is_some() {
            warn!(
                "sighting of {} after the run was finalized, ignored",
                event.plate_text
            );
            return false;
        }
        if !(event.confidence >= self.config.accuracy_threshold) {
            trace!(
                "dropping {} at frame {}: confidence {:.2} below {:.2}",
                event.plate_text,
                event.frame_index,
                event.confidence,
                self.config.accuracy_threshold
            );
            metrics::SIGHTINGS_DROPPED.inc();
            return false;
        }

        let expired = self.open.get(&event.plate_text).is_some_and(|session| {
            event.frame_index.saturating_sub(session.last_frame_index)
                > self.config.session_timeout_frames
        });
        if expired {
            self.close(&event.plate_text);
        }

        self.last_frame_index = self.last_frame_index.max(Some(event.frame_index));
        metrics::SIGHTINGS_ACCEPTED.inc();

        match self.open.get_mut(&event.plate_text) {
            Some(session) => {
                if event.frame_index > session.last_frame_index {
                    session.last_frame_index = event.frame_index;
                    session.last_timestamp = event.timestamp;
                    session.sightings += 1;
                }
                session.best_confidence = session.best_confidence.max(event.confidence);
            }
            None => {
                info!(
                    "session opened for {} at frame {}",
                    event.plate_text, event.frame_index
                );
                self.open.insert(
                    event.plate_text.clone(),
                    Session {
                        plate_text: event.plate_text,
                        first_frame_index: event.frame_index,
                        last_frame_index: event.frame_index,
                        last_timestamp: event.timestamp,
                        is_open: true,
                        sightings: 1,
                        best_confidence: event.confidence,
                    },
                );
            }
        }
        true
    }

    /// Advances the tracker to a processed frame and closes sessions whose gap
    /// now exceeds the timeout.
    pub fn tick(&mut self, frame_index: u64, timestamp: Duration) -> Vec<Session> {
        if self.summary.is_some() {
            return Vec::new();
        }
        self.frames_processed += 1;
        self.last_frame_index = self.last_frame_index.max(Some(frame_index));

        let timeout = self.config.session_timeout_frames;
        let expired: Vec<String> = self
            .open
            .values()
            .filter(|session| frame_index.saturating_sub(session.last_frame_index) > timeout)
            .map(|session| session.plate_text.clone())
            .collect();

        expired
            .iter()
            .filter_map(|plate| {
                let closed = self.close(plate)?;
                trace!("{plate} timed out at frame {frame_index} ({timestamp:?})");
                Some(closed)
            })
            .collect()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            counts: self.counts.clone(),
            open_plates: self.open.keys().cloned().collect(),
            last_frame_index: self.last_frame_index,
            frames_processed: self.frames_processed,
        }
    }

    /// Counts every still open session and freezes the tracker.
    pub fn finalize(&mut self) -> RunSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }

        let remaining: Vec<String> = self.open.keys().cloned().collect();
        for plate in &remaining {
            self.close(plate);
        }

        let summary = RunSummary {
            counts: self.counts.clone(),
            total_frames_processed: self.frames_processed,
            elapsed: self.started.elapsed(),
        };
        info!(
            "run finalized: {} sessions over {} plates, {} frames processed",
            summary.total_sessions(),
            summary.counts.len(),
            summary.total_frames_processed
        );
        self.summary = Some(summary.clone());
        summary
    }

    fn close(&mut self, plate: &str) -> Option<Session> {
        let mut session = self.open.remove(plate)?;
        session.is_open = false;
        *self.counts.entry(session.plate_text.clone()).or_insert(0) += 1;
        metrics::SESSIONS_CLOSED.inc();
        info!(
            "session closed for {} (frames {}..={}, {} sightings, best {:.2})",
            session.plate_text,
            session.first_frame_index,
            session.last_frame_index,
            session.sightings,
            session.best_confidence
        );
        Some(session)
    }
}
