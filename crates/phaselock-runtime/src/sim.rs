//! Simulated platform with a virtual microsecond clock.
//!
//! Waits never block: arming an alarm jumps the virtual clock straight to
//! the target (plus an optional wake skid). Callbacks can call
//! [`SimulatedPlatform::advance`] to model work that takes time. Every
//! armed target is recorded so tests can inspect the exact schedule.

use crate::alarm::{AlarmId, AlarmPlatform, WaitOutcome};
use phaselock_common::error::{PhaselockError, PhaselockResult};
use phaselock_common::time::TimePoint;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

#[derive(Debug, Default)]
struct SimState {
    now_us: i64,
    wake_skid_us: i64,
    next_id: u32,
    active: Vec<AlarmId>,
    cancelled: Vec<AlarmId>,
    armed_targets: Vec<TimePoint>,
    acquired_total: u32,
    released_total: u32,
    fail_acquire: bool,
    fail_arm_after: Option<usize>,
}

/// Deterministic platform for tests and dry runs.
#[derive(Debug, Default)]
pub struct SimulatedPlatform {
    state: Mutex<SimState>,
}

impl SimulatedPlatform {
    /// Create a platform whose clock reads `start_us`.
    #[must_use]
    pub fn new(start_us: i64) -> Self {
        Self {
            state: Mutex::new(SimState {
                now_us: start_us,
                next_id: 1,
                ..SimState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay every wake by `skid_us` past its target.
    #[must_use]
    pub fn with_wake_skid(self, skid_us: i64) -> Self {
        self.lock().wake_skid_us = skid_us;
        self
    }

    /// Make every [`AlarmPlatform::acquire`] fail.
    #[must_use]
    pub fn failing_acquire(self) -> Self {
        self.lock().fail_acquire = true;
        self
    }

    /// Fail every arm after `successful` arms have succeeded.
    #[must_use]
    pub fn failing_arm_after(self, successful: usize) -> Self {
        self.lock().fail_arm_after = Some(successful);
        self
    }

    /// Move the virtual clock forward, e.g. to model a long callback.
    pub fn advance(&self, us: i64) {
        let mut state = self.lock();
        state.now_us = state.now_us.saturating_add(us);
    }

    /// Every target the loop armed, in order.
    #[must_use]
    pub fn armed_targets(&self) -> Vec<TimePoint> {
        self.lock().armed_targets.clone()
    }

    /// Alarms currently held.
    #[must_use]
    pub fn active_alarms(&self) -> usize {
        self.lock().active.len()
    }

    /// Total (acquired, released) alarm counts.
    #[must_use]
    pub fn alarm_counts(&self) -> (u32, u32) {
        let state = self.lock();
        (state.acquired_total, state.released_total)
    }
}

impl AlarmPlatform for SimulatedPlatform {
    fn now(&self) -> TimePoint {
        TimePoint::from_micros(self.lock().now_us)
    }

    fn acquire(&self, name: &str) -> PhaselockResult<AlarmId> {
        let mut state = self.lock();
        if state.fail_acquire {
            return Err(PhaselockError::StartupFailure(format!(
                "simulated notifier for {name} unavailable"
            )));
        }

        let id = AlarmId(state.next_id.max(1));
        state.next_id = id.0 + 1;
        state.active.push(id);
        state.acquired_total += 1;
        Ok(id)
    }

    fn arm_and_wait(&self, id: AlarmId, target: TimePoint) -> PhaselockResult<WaitOutcome> {
        let mut state = self.lock();

        if !state.active.contains(&id) {
            return Err(PhaselockError::AlarmFailure(format!("{id} is not registered")));
        }
        if state.cancelled.contains(&id) {
            return Ok(WaitOutcome::Cancelled);
        }
        if let Some(limit) = state.fail_arm_after {
            if state.armed_targets.len() >= limit {
                return Err(PhaselockError::AlarmFailure(format!(
                    "simulated arm failure for {id} at {target}"
                )));
            }
        }

        state.armed_targets.push(target);
        let woke_at = state
            .now_us
            .max(target.as_micros())
            .saturating_add(state.wake_skid_us);
        state.now_us = woke_at;
        let woke_at = TimePoint::from_micros(woke_at);

        trace!(%id, %target, %woke_at, "Simulated alarm fired");
        Ok(WaitOutcome::Fired(woke_at))
    }

    fn cancel(&self, id: AlarmId) {
        let mut state = self.lock();
        if !state.cancelled.contains(&id) {
            state.cancelled.push(id);
        }
    }

    fn release(&self, id: AlarmId) {
        let mut state = self.lock();
        if let Some(pos) = state.active.iter().position(|a| *a == id) {
            state.active.remove(pos);
            state.released_total += 1;
        }
    }
}
