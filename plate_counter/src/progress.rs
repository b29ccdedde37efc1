use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info};

use crate::pipeline::RunReport;
use crate::session::TrackerSnapshot;

/// Receives live snapshots while a run is in progress. Implementations must
/// return quickly, they are called on the detection thread.
pub trait ProgressReporter {
    fn on_progress(&mut self, snapshot: &TrackerSnapshot);

    fn on_finished(&mut self, _report: &RunReport) {}
}

/// Writes each snapshot to the log.
#[derive(Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn on_progress(&mut self, snapshot: &TrackerSnapshot) {
        let counted: u64 = snapshot.counts.values().sum();
        info!(
            "progress: {} frames processed, {} sessions counted, {} open {:?}",
            snapshot.frames_processed,
            counted,
            snapshot.open_plates.len(),
            snapshot.open_plates
        );
    }

    fn on_finished(&mut self, report: &RunReport) {
        info!(
            "finished ({:?}) after {} frames read: {:?}",
            report.stop_reason, report.frames_read, report.summary.counts
        );
    }
}

#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Snapshot(TrackerSnapshot),
    Finished(RunReport),
}

/// Forwards updates over a bounded channel. Snapshots are dropped when the
/// consumer falls behind; the final report evicts the oldest pending update
/// instead, so it is always delivered while the receiver lives.
pub struct ChannelReporter {
    sender: Sender<ProgressUpdate>,
    backlog: Receiver<ProgressUpdate>,
    dropped: u64,
}

impl ChannelReporter {
    pub fn with_capacity(capacity: usize) -> (Self, Receiver<ProgressUpdate>) {
        let (sender, receiver) = bounded(capacity.max(1));
        let reporter = Self {
            sender,
            backlog: receiver.clone(),
            dropped: 0,
        };
        (reporter, receiver)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_progress(&mut self, snapshot: &TrackerSnapshot) {
        match self.sender.try_send(ProgressUpdate::Snapshot(snapshot.clone())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                debug!("progress channel full, snapshot dropped");
            }
            Err(TrySendError::Disconnected(_)) => debug!("progress receiver gone"),
        }
    }

    fn on_finished(&mut self, report: &RunReport) {
        let mut update = ProgressUpdate::Finished(report.clone());
        loop {
            match self.sender.try_send(update) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.backlog.try_recv().is_ok() {
                        self.dropped += 1;
                        debug!("progress channel full, oldest update evicted");
                    }
                    update = rejected;
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("progress receiver gone");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn snapshot(frames: u64) -> TrackerSnapshot {
        TrackerSnapshot {
            counts: BTreeMap::new(),
            open_plates: Vec::new(),
            last_frame_index: Some(frames),
            frames_processed: frames,
        }
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (mut reporter, receiver) = ChannelReporter::with_capacity(2);
        for frames in 0..5 {
            reporter.on_progress(&snapshot(frames));
        }
        assert_eq!(reporter.dropped(), 3);

        let received: Vec<_> = receiver.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(&received[0], ProgressUpdate::Snapshot(s) if s.frames_processed == 0));
    }

    #[test]
    fn final_report_displaces_pending_snapshots() {
        let (mut reporter, receiver) = ChannelReporter::with_capacity(1);
        reporter.on_progress(&snapshot(1));
        reporter.on_progress(&snapshot(2));
        reporter.on_finished(&RunReport {
            summary: crate::session::RunSummary {
                counts: BTreeMap::from([("A".to_string(), 1)]),
                total_frames_processed: 2,
                elapsed: std::time::Duration::ZERO,
            },
            stop_reason: crate::pipeline::StopReason::EndOfStream,
            frames_read: 2,
        });

        let received: Vec<_> = receiver.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert!(matches!(&received[0], ProgressUpdate::Finished(r) if r.frames_read == 2));
        assert_eq!(reporter.dropped(), 2);
    }

    #[test]
    fn disconnected_receiver_is_ignored() {
        let (mut reporter, receiver) = ChannelReporter::with_capacity(1);
        drop(receiver);
        reporter.on_progress(&snapshot(1));
        assert_eq!(reporter.dropped(), 0);
    }
}
