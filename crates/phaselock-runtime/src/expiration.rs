//! Phase-locked expiration arithmetic.
//!
//! Every wake target lies on the grid `expiration + offset + n * period`.
//! When the caller is on time the next target is simply one period ahead.
//! When the caller fell behind, whole elapsed periods are skipped so the
//! target snaps forward to the next slot on the anchored grid instead of
//! restarting the phase from "now".

use phaselock_common::error::{PhaselockError, PhaselockResult};
use phaselock_common::time::{Period, TimePoint};

/// Compute the next aligned wake time.
///
/// Returns the smallest value of the form
/// `expiration_us + offset_us + k * period_us` (integer `k`) that lies
/// strictly after `current_us`.
///
/// # Errors
///
/// Returns [`PhaselockError::InvalidPeriod`] if `period_us <= 0` and
/// [`PhaselockError::TimeOverflow`] if the result is not representable.
///
/// # Examples
///
/// ```
/// use phaselock_common::TimePoint;
/// use phaselock_runtime::next_expiration;
///
/// let t = |us| TimePoint::from_micros(us);
/// assert_eq!(next_expiration(t(1000), 0, 100, t(1000)).unwrap(), t(1100));
/// assert_eq!(next_expiration(t(1000), 0, 100, t(1250)).unwrap(), t(1300));
/// assert_eq!(next_expiration(t(1000), -50, 100, t(1000)).unwrap(), t(1050));
/// ```
pub fn next_expiration(
    expiration_us: TimePoint,
    offset_us: i64,
    period_us: i64,
    current_us: TimePoint,
) -> PhaselockResult<TimePoint> {
    let period = Period::from_micros(period_us)?;
    next_aligned(expiration_us, offset_us, period, current_us)
}

/// [`next_expiration`] with an already validated period.
///
/// # Errors
///
/// Returns [`PhaselockError::TimeOverflow`] if the result is not representable.
pub fn next_aligned(
    expiration: TimePoint,
    offset_us: i64,
    period: Period,
    current: TimePoint,
) -> PhaselockResult<TimePoint> {
    let base = expiration.checked_add_us(offset_us)?;
    let elapsed = current
        .as_micros()
        .checked_sub(base.as_micros())
        .ok_or(PhaselockError::TimeOverflow)?;

    // Floor division: a negative elapsed time must round toward the earlier slot.
    let whole_periods = elapsed.div_euclid(period.as_micros());

    let advance = whole_periods
        .checked_add(1)
        .and_then(|k| k.checked_mul(period.as_micros()))
        .ok_or(PhaselockError::TimeOverflow)?;

    base.checked_add_us(advance)
}

/// Number of grid slots strictly between `previous` and `next`.
///
/// Both arguments are expected on the same grid; zero means `next` is the
/// slot immediately following `previous`.
#[must_use]
pub fn slots_skipped(previous: TimePoint, next: TimePoint, period: Period) -> u64 {
    let gap = next.micros_since(previous).div_euclid(period.as_micros());
    u64::try_from(gap.saturating_sub(1)).unwrap_or(0)
}
