// ABOUTME: Reconnect delay sequences.
// ABOUTME: Exponential backoff from an initial delay, capped at a maximum.

use std::time::Duration;

use crate::error::ConnectorError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicyOptions {
    initial_backoff: Duration,
    maximum_backoff: Duration,
    multiplier: f64,
}

impl BackoffPolicyOptions {
    pub fn new(
        initial_backoff: Duration,
        maximum_backoff: Duration,
        multiplier: f64,
    ) -> Result<Self, ConnectorError> {
        if maximum_backoff < initial_backoff {
            return Err(ConnectorError::InvalidArgument(format!(
                "maximum backoff {maximum_backoff:?} is shorter than initial backoff {initial_backoff:?}"
            )));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConnectorError::InvalidArgument(format!(
                "backoff multiplier must be at least 1.0, got {multiplier}"
            )));
        }
        Ok(Self {
            initial_backoff,
            maximum_backoff,
            multiplier,
        })
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn maximum_backoff(&self) -> Duration {
        self.maximum_backoff
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Default for BackoffPolicyOptions {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            maximum_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Stateful generator of successive delays.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    options: BackoffPolicyOptions,
    previous: Option<Duration>,
}

impl BackoffPolicy {
    pub fn new(options: BackoffPolicyOptions) -> Self {
        Self {
            options,
            previous: None,
        }
    }

    pub fn options(&self) -> &BackoffPolicyOptions {
        &self.options
    }

    pub fn next(&mut self) -> Duration {
        let delay = match self.previous {
            None => self.options.initial_backoff,
            Some(previous) => previous
                .mul_f64(self.options.multiplier)
                .min(self.options.maximum_backoff),
        };
        self.previous = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}
