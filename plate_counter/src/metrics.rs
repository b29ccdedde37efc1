use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref FRAMES_READ: IntCounter = register_int_counter!(
        "plate_counter_frames_read_total",
        "Frames pulled from a frame source"
    )
    .expect("metric registers");
    pub static ref FRAMES_PROCESSED: IntCounter = register_int_counter!(
        "plate_counter_frames_processed_total",
        "Sampled frames that went through detection"
    )
    .expect("metric registers");
    pub static ref FRAME_ERRORS: IntCounter = register_int_counter!(
        "plate_counter_frame_errors_total",
        "Frames that could not be decoded"
    )
    .expect("metric registers");
    pub static ref INFERENCE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "plate_counter_inference_errors_total",
        "Detector and recognizer failures",
        &["stage"]
    )
    .expect("metric registers");
    pub static ref SIGHTINGS_ACCEPTED: IntCounter = register_int_counter!(
        "plate_counter_sightings_accepted_total",
        "Sightings that opened or refreshed a session"
    )
    .expect("metric registers");
    pub static ref SIGHTINGS_DROPPED: IntCounter = register_int_counter!(
        "plate_counter_sightings_dropped_total",
        "Sightings below the accuracy threshold"
    )
    .expect("metric registers");
    pub static ref SESSIONS_CLOSED: IntCounter = register_int_counter!(
        "plate_counter_sessions_closed_total",
        "Sighting sessions counted"
    )
    .expect("metric registers");
    pub static ref RUNS: IntCounterVec = register_int_counter_vec!(
        "plate_counter_runs_total",
        "Finished runs by stop reason",
        &["reason"]
    )
    .expect("metric registers");
}

/// Text exposition of every registered metric.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        log::warn!("could not encode metrics: {err}");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_lists_counters() {
        SESSIONS_CLOSED.inc_by(0);
        INFERENCE_ERRORS.with_label_values(&["detector"]).inc_by(0);
        let text = gather_text();
        assert!(text.contains("plate_counter_sessions_closed_total"));
        assert!(text.contains("plate_counter_inference_errors_total{stage=\"detector\"}"));
    }
}
