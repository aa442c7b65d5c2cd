//! Host platform backed by the operating system's monotonic clock.
//!
//! Alarms block on a condition variable with the absolute target re-checked
//! against `CLOCK_MONOTONIC` after every wakeup, so spurious or early
//! wakeups never fire a tick. Cancellation flips a flag under the alarm's
//! mutex and notifies the condition variable, interrupting a blocked wait.

use crate::alarm::{AlarmId, AlarmPlatform, WaitOutcome};
use phaselock_common::error::{PhaselockError, PhaselockResult};
use phaselock_common::time::TimePoint;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Real-time platform using `CLOCK_MONOTONIC` and condvar-backed alarms.
#[derive(Debug)]
pub struct HostPlatform {
    next_id: AtomicU32,
    alarms: Mutex<HashMap<AlarmId, Arc<AlarmSlot>>>,
    /// Last clock reading, returned if a later read fails.
    last_reading_us: AtomicI64,
    #[cfg(not(unix))]
    origin: std::time::Instant,
    #[cfg(test)]
    clock_fault: std::sync::atomic::AtomicBool,
}

#[derive(Debug)]
struct AlarmSlot {
    name: String,
    cancelled: Mutex<bool>,
    wakeup: Condvar,
}

impl HostPlatform {
    /// Create a host platform, verifying the monotonic clock is readable.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::StartupFailure`] if the clock cannot be read.
    pub fn new() -> PhaselockResult<Self> {
        let platform = Self {
            next_id: AtomicU32::new(1),
            alarms: Mutex::new(HashMap::new()),
            last_reading_us: AtomicI64::new(0),
            #[cfg(not(unix))]
            origin: std::time::Instant::now(),
            #[cfg(test)]
            clock_fault: std::sync::atomic::AtomicBool::new(false),
        };

        let first = platform
            .read_clock()
            .map_err(|e| PhaselockError::StartupFailure(format!("monotonic clock unavailable: {e}")))?;
        platform.last_reading_us.store(first, Ordering::Release);

        Ok(platform)
    }

    #[cfg(unix)]
    fn read_clock(&self) -> Result<i64, String> {
        use nix::time::{clock_gettime, ClockId};

        if self.clock_faulted() {
            return Err(String::from("injected clock fault"));
        }

        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(|e| e.to_string())?;
        Ok(i64::from(ts.tv_sec()) * 1_000_000 + i64::from(ts.tv_nsec()) / 1_000)
    }

    #[cfg(not(unix))]
    fn read_clock(&self) -> Result<i64, String> {
        if self.clock_faulted() {
            return Err(String::from("injected clock fault"));
        }
        i64::try_from(self.origin.elapsed().as_micros()).map_err(|e| e.to_string())
    }

    #[cfg(test)]
    fn clock_faulted(&self) -> bool {
        self.clock_fault.load(Ordering::Acquire)
    }

    #[cfg(not(test))]
    #[allow(clippy::unused_self)]
    fn clock_faulted(&self) -> bool {
        false
    }

    fn lock_alarms(&self) -> MutexGuard<'_, HashMap<AlarmId, Arc<AlarmSlot>>> {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: AlarmId) -> Option<Arc<AlarmSlot>> {
        self.lock_alarms().get(&id).cloned()
    }

    /// Number of alarms currently held.
    #[must_use]
    pub fn active_alarms(&self) -> usize {
        self.lock_alarms().len()
    }
}

impl AlarmPlatform for HostPlatform {
    fn now(&self) -> TimePoint {
        match self.read_clock() {
            Ok(us) => {
                self.last_reading_us.fetch_max(us, Ordering::AcqRel);
                TimePoint::from_micros(us)
            }
            Err(e) => {
                warn!(error = %e, "Monotonic clock read failed, reusing last reading");
                TimePoint::from_micros(self.last_reading_us.load(Ordering::Acquire))
            }
        }
    }

    fn acquire(&self, name: &str) -> PhaselockResult<AlarmId> {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        if raw == 0 {
            return Err(PhaselockError::StartupFailure(
                "alarm identifiers exhausted".into(),
            ));
        }

        let id = AlarmId(raw);
        let slot = Arc::new(AlarmSlot {
            name: name.to_owned(),
            cancelled: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        self.lock_alarms().insert(id, slot);
        debug!(%id, name, "Host alarm initialized");
        Ok(id)
    }

    fn arm_and_wait(&self, id: AlarmId, target: TimePoint) -> PhaselockResult<WaitOutcome> {
        let slot = self
            .slot(id)
            .ok_or_else(|| PhaselockError::AlarmFailure(format!("{id} is not registered")))?;

        let mut cancelled = slot
            .cancelled
            .lock()
            .map_err(|_| PhaselockError::AlarmFailure(format!("{id} state poisoned")))?;

        loop {
            if *cancelled {
                trace!(%id, name = %slot.name, "Wait cancelled");
                return Ok(WaitOutcome::Cancelled);
            }

            // No fallback reading here; a clock fault fails the wait.
            let now = self
                .read_clock()
                .map(TimePoint::from_micros)
                .map_err(|e| PhaselockError::AlarmFailure(format!("{id} clock read failed: {e}")))?;
            if now >= target {
                return Ok(WaitOutcome::Fired(now));
            }

            let remaining = u64::try_from(target.micros_since(now)).unwrap_or(0);
            let (guard, _) = slot
                .wakeup
                .wait_timeout(cancelled, Duration::from_micros(remaining))
                .map_err(|_| PhaselockError::AlarmFailure(format!("{id} state poisoned")))?;
            cancelled = guard;
        }
    }

    fn cancel(&self, id: AlarmId) {
        if let Some(slot) = self.slot(id) {
            let mut cancelled = slot.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
            *cancelled = true;
            slot.wakeup.notify_all();
        }
    }

    fn release(&self, id: AlarmId) {
        if let Some(slot) = self.lock_alarms().remove(&id) {
            // Wake anything still blocked on a released alarm.
            let mut cancelled = slot.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
            *cancelled = true;
            slot.wakeup.notify_all();
            debug!(%id, name = %slot.name, "Host alarm released");
        }
    }
}
