use std::time::{Duration, Instant};

/// Holds a producer to a target frame rate.
pub struct FpsLimiter {
    fps_control: Instant,
    fps_wait: Duration,
}

impl FpsLimiter {
    pub fn new(fps: f64) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };
        Self {
            fps_control: Instant::now(),
            fps_wait: Duration::from_secs_f64(1.0 / fps),
        }
    }

    pub fn interval(&self) -> Duration {
        self.fps_wait
    }

    /// Sleeps out the rest of the current frame interval.
    pub fn wait(&mut self) {
        let elapsed = self.fps_control.elapsed();

        if self.fps_wait > elapsed {
            spin_sleep::sleep(self.fps_wait - elapsed);
        }

        self.fps_control = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_roughly_one_interval() {
        let mut limiter = FpsLimiter::new(200.0);
        assert_eq!(limiter.interval(), Duration::from_millis(5));

        let started = Instant::now();
        limiter.wait();
        limiter.wait();
        assert!(started.elapsed() >= Duration::from_millis(9));
    }

    #[test]
    fn invalid_rates_fall_back() {
        let limiter = FpsLimiter::new(0.0);
        assert_eq!(limiter.interval(), Duration::from_secs_f64(1.0 / 30.0));
    }
}
