// ABOUTME: Credit accounting for flow-controlled streams.
// ABOUTME: PermitCount budgets, PermitCounter tallies, and the FlowController refill signal.

use std::fmt;

use crate::error::ConnectorError;

/// A strictly positive flow-control budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermitCount(i64);

impl PermitCount {
    pub const MIN: PermitCount = PermitCount(1);
    pub const MAX: PermitCount = PermitCount(i64::MAX);

    pub fn new(value: i64) -> Result<Self, ConnectorError> {
        if value <= 0 {
            return Err(ConnectorError::InvalidArgument(format!(
                "permit count must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn max(a: PermitCount, b: PermitCount) -> PermitCount {
        std::cmp::max(a, b)
    }
}

impl fmt::Display for PermitCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i64> for PermitCount {
    type Error = ConnectorError;
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        PermitCount::new(value)
    }
}

/// A non-negative running count of consumed permits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermitCounter(i64);

impl PermitCounter {
    pub const ZERO: PermitCounter = PermitCounter(0);

    pub fn new(value: i64) -> Result<Self, ConnectorError> {
        if value < 0 {
            return Err(ConnectorError::InvalidArgument(format!(
                "permit counter must not be negative, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn increment(self) -> Result<Self, ConnectorError> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or_else(|| ConnectorError::InvalidArgument("permit counter overflow".into()))
    }

    pub fn max(a: PermitCounter, b: PermitCounter) -> PermitCounter {
        std::cmp::max(a, b)
    }
}

impl PartialEq<PermitCount> for PermitCounter {
    fn eq(&self, other: &PermitCount) -> bool {
        self.0 == other.0
    }
}

/// Decides when the consumer of a stream must ask for more permits.
#[derive(Debug, Clone)]
pub struct FlowController {
    initial: PermitCount,
    threshold: PermitCount,
    current: PermitCounter,
}

impl FlowController {
    pub fn new(initial: PermitCount, threshold: PermitCount) -> Self {
        Self {
            initial,
            threshold,
            current: PermitCounter::ZERO,
        }
    }

    pub fn initial(&self) -> PermitCount {
        self.initial
    }

    pub fn threshold(&self) -> PermitCount {
        self.threshold
    }

    pub fn current(&self) -> PermitCounter {
        self.current
    }

    /// Count one consumed message. Returns true when `threshold` more permits
    /// should be requested.
    pub fn increment(&mut self) -> bool {
        // The counter wraps at the threshold, so it never exceeds it.
        self.current = PermitCounter(self.current.0 + 1);
        if self.current == self.threshold {
            self.current = PermitCounter::ZERO;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.current = PermitCounter::ZERO;
    }
}
