//! Microsecond timebase shared by the calculator, the loop, and platforms.
//!
//! A [`TimePoint`] counts microseconds since an arbitrary monotonic epoch
//! chosen by the platform clock. Only differences between readings are
//! meaningful. Values are signed so offset arithmetic never needs casts.

use crate::error::{PhaselockError, PhaselockResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute reading of the platform's monotonic microsecond clock.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimePoint(i64);

impl TimePoint {
    /// The clock epoch.
    pub const ZERO: TimePoint = TimePoint(0);

    /// Construct a time point from raw microseconds.
    #[must_use]
    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    /// Raw microseconds since the epoch.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Add a signed microsecond delta, failing on overflow.
    pub fn checked_add_us(self, delta_us: i64) -> PhaselockResult<Self> {
        self.0
            .checked_add(delta_us)
            .map(Self)
            .ok_or(PhaselockError::TimeOverflow)
    }

    /// Signed microseconds from `earlier` to `self`.
    #[must_use]
    pub fn micros_since(self, earlier: TimePoint) -> i64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for TimePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Loop period in microseconds, guaranteed strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Period(i64);

impl Period {
    /// Validate a period given in microseconds.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::InvalidPeriod`] when `us <= 0`.
    pub fn from_micros(us: i64) -> PhaselockResult<Self> {
        if us <= 0 {
            return Err(PhaselockError::InvalidPeriod { period_us: us });
        }
        Ok(Self(us))
    }

    /// Period length in microseconds.
    #[must_use]
    pub const fn as_micros(self) -> i64 {
        self.0
    }
}

impl TryFrom<std::time::Duration> for Period {
    type Error = PhaselockError;

    fn try_from(value: std::time::Duration) -> PhaselockResult<Self> {
        let us = i64::try_from(value.as_micros()).map_err(|_| PhaselockError::TimeOverflow)?;
        Self::from_micros(us)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let us = i64::deserialize(deserializer)?;
        Period::from_micros(us).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}
