use std::time::Duration;

/// What a source does when the shared channel stays full for a publish timeout.
///
/// One policy applies to every source of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PublishPolicy {
    /// Discard the frame and keep capturing.
    DropOnFull,
    /// Sleep and retry the same envelope until it fits or the source is stopped.
    Backoff(BackoffConfig),
}

impl Default for PublishPolicy {
    fn default() -> Self {
        PublishPolicy::Backoff(BackoffConfig::default())
    }
}

/// Multiplicative backoff between publish attempts.
///
/// Default values:
/// - 10ms initial delay, capped at 1s
/// - x1.5 after each full-channel timeout, /1.2 after each successful publish
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub grow: f64,
    pub shrink: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(1),
            grow: 1.5,
            shrink: 1.2,
        }
    }
}

/// Current backoff delay of one source, kept across frames so a persistently
/// slow consumer keeps the source backed off.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
        }
    }

    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to sleep now and grows the next one.
    pub(crate) fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .mul_f64(self.config.grow.max(1.0))
            .min(self.config.max);
        delay
    }

    pub(crate) fn on_success(&mut self) {
        self.current = self
            .current
            .div_f64(self.config.shrink.max(1.0))
            .max(self.config.initial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(
            diff < Duration::from_micros(1),
            "expected {:?}, got {:?}",
            expected,
            actual
        );
    }

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(300),
            grow: 1.5,
            shrink: 1.2,
        }
    }

    #[test]
    fn test_default_policy_is_backoff() {
        assert_eq!(
            PublishPolicy::default(),
            PublishPolicy::Backoff(BackoffConfig::default())
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(config());

        assert_close(backoff.on_failure(), Duration::from_millis(100));
        assert_close(backoff.on_failure(), Duration::from_millis(150));
        assert_close(backoff.on_failure(), Duration::from_millis(225));
        // 337.5ms capped at 300ms
        assert_eq!(backoff.on_failure(), Duration::from_millis(300));
        assert_eq!(backoff.current(), Duration::from_millis(300));
    }

    #[test]
    fn test_backoff_shrinks_to_initial() {
        let mut backoff = Backoff::new(config());
        backoff.on_failure();
        backoff.on_failure();
        assert_close(backoff.current(), Duration::from_millis(225));

        backoff.on_success();
        assert_close(backoff.current(), Duration::from_micros(187_500));

        for _ in 0..10 {
            backoff.on_success();
        }
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }
}
