//! Platform alarm abstraction and scoped alarm ownership.
//!
//! A platform provides a monotonic microsecond clock and alarms that block
//! the calling thread until an absolute timestamp. Each periodic loop owns
//! exactly one alarm, held by an [`AlarmGuard`] that releases it on every
//! exit path.

use phaselock_common::error::{PhaselockError, PhaselockResult};
use phaselock_common::time::TimePoint;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Identifier of an alarm registered with a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId(pub u32);

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alarm#{}", self.0)
    }
}

/// How a blocking alarm wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The target was reached; carries the actual wake time.
    Fired(TimePoint),
    /// The alarm was cancelled before or during the wait.
    Cancelled,
}

/// Timing facility consumed by the periodic loop.
///
/// Implementations must make [`cancel`](AlarmPlatform::cancel) sticky: once
/// an alarm is cancelled, the in-progress wait and every later wait on it
/// return [`WaitOutcome::Cancelled`].
pub trait AlarmPlatform: Send + Sync {
    /// Read the monotonic microsecond clock.
    fn now(&self) -> TimePoint;

    /// Register a new alarm.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::StartupFailure`] if no alarm can be allocated.
    fn acquire(&self, name: &str) -> PhaselockResult<AlarmId>;

    /// Arm `id` for `target` and block until it fires or is cancelled.
    ///
    /// A fired wait must report a wake time at or after `target`. The loop
    /// tolerates an early wake by never re-arming a slot that already fired,
    /// but the reported latency is then clamped to zero.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::AlarmFailure`] on platform error.
    fn arm_and_wait(&self, id: AlarmId, target: TimePoint) -> PhaselockResult<WaitOutcome>;

    /// Cancel `id`, waking any thread blocked on it. Safe from any thread.
    fn cancel(&self, id: AlarmId);

    /// Return `id` to the platform.
    fn release(&self, id: AlarmId);
}

impl<P: AlarmPlatform + ?Sized> AlarmPlatform for Arc<P> {
    fn now(&self) -> TimePoint {
        (**self).now()
    }

    fn acquire(&self, name: &str) -> PhaselockResult<AlarmId> {
        (**self).acquire(name)
    }

    fn arm_and_wait(&self, id: AlarmId, target: TimePoint) -> PhaselockResult<WaitOutcome> {
        (**self).arm_and_wait(id, target)
    }

    fn cancel(&self, id: AlarmId) {
        (**self).cancel(id);
    }

    fn release(&self, id: AlarmId) {
        (**self).release(id);
    }
}

/// Stop signal shared between a loop and its [`StopHandle`]s.
///
/// The alarm slot and the stop flag are only changed together under the
/// slot mutex, so a stop racing with acquisition either prevents the
/// acquisition or cancels the freshly acquired alarm.
pub(crate) struct AlarmCell<P: AlarmPlatform> {
    pub(crate) platform: P,
    slot: Mutex<Option<AlarmId>>,
    stop_requested: AtomicBool,
}

impl<P: AlarmPlatform> AlarmCell<P> {
    pub(crate) fn new(platform: P) -> Self {
        Self {
            platform,
            slot: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<AlarmId>> {
        // The slot holds a plain id; a poisoned lock leaves it consistent.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Type-erased stop target so handles do not carry the platform type.
pub(crate) trait StopTarget: Send + Sync {
    fn request_stop(&self);
    fn is_stop_requested(&self) -> bool;
}

impl<P: AlarmPlatform> StopTarget for AlarmCell<P> {
    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let slot = self.lock_slot();
        if let Some(id) = *slot {
            debug!(%id, "Cancelling alarm");
            self.platform.cancel(id);
        }
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Cloneable, thread-safe handle that stops a periodic loop.
#[derive(Clone)]
pub struct StopHandle {
    target: Arc<dyn StopTarget>,
}

impl StopHandle {
    pub(crate) fn new(target: Arc<dyn StopTarget>) -> Self {
        Self { target }
    }

    /// Stop the loop. Idempotent and safe to call from any thread.
    ///
    /// A blocked wait returns immediately as cancelled; the callback is not
    /// invoked for that wake.
    pub fn stop(&self) {
        self.target.request_stop();
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.target.is_stop_requested()
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Scoped ownership of a loop's single alarm.
///
/// Dropping the guard releases the alarm, including during unwinding.
pub(crate) struct AlarmGuard<'a, P: AlarmPlatform> {
    cell: &'a AlarmCell<P>,
    id: AlarmId,
}

impl<'a, P: AlarmPlatform> AlarmGuard<'a, P> {
    /// Acquire the alarm unless a stop was already requested.
    ///
    /// Returns `Ok(None)` when the loop was stopped before it started.
    pub(crate) fn acquire(cell: &'a AlarmCell<P>, name: &str) -> PhaselockResult<Option<Self>> {
        let mut slot = cell.lock_slot();
        if cell.stop_requested.load(Ordering::Acquire) {
            return Ok(None);
        }

        let id = cell.platform.acquire(name).map_err(|e| match e {
            PhaselockError::StartupFailure(_) => e,
            other => PhaselockError::StartupFailure(other.to_string()),
        })?;
        *slot = Some(id);
        debug!(%id, name, "Alarm acquired");

        Ok(Some(Self { cell, id }))
    }

    pub(crate) fn id(&self) -> AlarmId {
        self.id
    }
}

impl<P: AlarmPlatform> Drop for AlarmGuard<'_, P> {
    fn drop(&mut self) {
        let mut slot = self.cell.lock_slot();
        *slot = None;
        self.cell.platform.release(self.id);
        debug!(id = %self.id, "Alarm released");
    }
}
