//! Error backoff for background refresh retries

use std::time::Duration;

/// Configuration for how quickly background retries back off after failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 1 second with a multiplier of 2. Maximum delay is
    /// capped at 60 seconds.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_secs(1),
            max_error_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// The first consecutive failure waits `initial_error_delay`. Each further
    /// failure multiplies the previous delay by `multiplier`, never exceeding
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }
}

/// Tracks consecutive failures and hands out the delay before the next attempt
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
        }
    }

    /// Reports a success, resetting the delay
    pub fn success(&mut self) {
        self.last_delay = None;
    }

    /// Reports a failure and returns how long to wait before trying again
    pub fn error(&mut self) -> Duration {
        let delay = match self.last_delay {
            Some(last) => last.saturating_mul(self.config.multiplier),
            None => self.config.initial_error_delay,
        }
        .min(self.config.max_error_delay);

        self.last_delay = Some(delay);
        delay
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}
