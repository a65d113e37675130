use std::time::{Duration, Instant};

/// Spaces consecutive capture calls at least `1 / fps` apart.
///
/// One instance per worker; it holds only the time of the previous call.
pub struct RateLimiter {
    interval: Option<Duration>,
    last: Option<Instant>,
    total_delay: Duration,
}

impl RateLimiter {
    /// `fps <= 0` (or a non-finite value) disables limiting.
    pub fn new(fps: f64) -> Self {
        let interval = (fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));
        Self {
            interval,
            last: None,
            total_delay: Duration::ZERO,
        }
    }

    /// Block until the minimum interval since the previous call has elapsed.
    pub fn wait(&mut self) {
        let remaining = self.remaining();
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        self.mark(remaining);
    }

    /// Time left before the next call is allowed, zero when it may proceed now.
    pub fn remaining(&self) -> Duration {
        match (self.interval, self.last) {
            (Some(interval), Some(last)) => interval.saturating_sub(last.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Record a call made after waiting `waited` outside the limiter.
    pub fn mark(&mut self, waited: Duration) {
        if self.interval.is_none() {
            return;
        }
        self.total_delay += waited;
        self.last = Some(Instant::now());
    }

    /// Minimum spacing between calls, `None` when unthrottled.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Time spent suspended so far.
    pub fn total_delay(&self) -> Duration {
        self.total_delay
    }
}
