//! Drift-correcting periodic alarm loop.
//!
//! The loop owns one platform alarm and runs on the caller's thread:
//! 1. Read the clock and compute the next aligned target
//! 2. Arm the alarm and block until it fires or is cancelled
//! 3. Invoke the tick handler
//! 4. Advance the reference to the *intended* target
//!
//! Advancing from the target rather than the observed wake time keeps every
//! tick on the grid anchored at the start epoch; late wakes show up as
//! latency and skipped slots, never as accumulated drift.

use crate::alarm::{AlarmCell, AlarmGuard, AlarmPlatform, StopHandle, StopTarget, WaitOutcome};
use crate::expiration::{next_aligned, slots_skipped};
use phaselock_common::config::LoopConfig;
use phaselock_common::error::{PhaselockError, PhaselockResult};
use phaselock_common::metrics::{MetricsSnapshot, TickMetrics};
use phaselock_common::state::{LoopState, StateMachine};
use phaselock_common::time::{Period, TimePoint};
use serde::Serialize;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Default period in microseconds (20 ms).
pub const DEFAULT_PERIOD_US: i64 = 20_000;

/// Default late-tick threshold in microseconds.
pub const DEFAULT_LATE_THRESHOLD_US: u64 = 1_000;

const DEFAULT_HISTOGRAM_SIZE: usize = 1_024;

/// Schedule arithmetic state, touched only by the loop thread.
///
/// `reference` stays on the unshifted grid; targets are
/// `reference + offset + k * period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleState {
    reference: TimePoint,
    offset_us: i64,
    period: Period,
}

impl ScheduleState {
    /// Anchor a schedule at `epoch`.
    #[must_use]
    pub fn new(epoch: TimePoint, offset_us: i64, period: Period) -> Self {
        Self {
            reference: epoch,
            offset_us,
            period,
        }
    }

    /// Reference expiration on the unshifted grid.
    #[must_use]
    pub fn reference(&self) -> TimePoint {
        self.reference
    }

    /// Fixed grid offset in microseconds.
    #[must_use]
    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    /// Tick period.
    #[must_use]
    pub fn period(&self) -> Period {
        self.period
    }

    /// Next target strictly after both `now` and the last intended target.
    ///
    /// A clock reading behind the last target (a platform that woke early)
    /// never re-arms a slot that already fired.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::TimeOverflow`] if the target is not representable.
    pub fn next_target(&self, now: TimePoint) -> PhaselockResult<TimePoint> {
        let previous = self.reference.checked_add_us(self.offset_us)?;
        next_aligned(self.reference, self.offset_us, self.period, now.max(previous))
    }

    /// Grid slots between the last intended target and `target`.
    #[must_use]
    pub fn skipped_before(&self, target: TimePoint) -> u64 {
        let previous = self.reference.checked_add_us(self.offset_us);
        previous.map_or(0, |previous| slots_skipped(previous, target, self.period))
    }

    /// Move the reference to an intended target.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::TimeOverflow`] if removing the offset overflows.
    pub fn advance(&mut self, target: TimePoint) -> PhaselockResult<()> {
        let unshift = self
            .offset_us
            .checked_neg()
            .ok_or(PhaselockError::TimeOverflow)?;
        self.reference = target.checked_add_us(unshift)?;
        Ok(())
    }
}

/// Information handed to the tick handler for one wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickContext {
    /// 1-based tick number.
    pub tick: u64,
    /// Time the alarm was armed for.
    pub target: TimePoint,
    /// Time the alarm actually fired; stable for the whole callback.
    pub woke_at: TimePoint,
    /// Grid slots passed over before this tick.
    pub skipped_slots: u64,
}

impl TickContext {
    /// Start time of the current iteration, in the platform timebase.
    #[must_use]
    pub fn loop_start_time(&self) -> TimePoint {
        self.woke_at
    }

    /// Signed wake latency in microseconds.
    #[must_use]
    pub fn latency_us(&self) -> i64 {
        self.woke_at.micros_since(self.target)
    }
}

/// Periodic callback invoked once per wake.
pub trait TickHandler {
    /// Error type returned by a failed tick.
    type Error: fmt::Display;

    /// Handle one tick on the loop's thread.
    ///
    /// # Errors
    ///
    /// Any error is forwarded to [`TickHandler::on_error`]; the loop never retries.
    fn on_tick(&mut self, ctx: &TickContext) -> Result<(), Self::Error>;

    /// Decide whether the loop continues after a failed tick.
    ///
    /// The default keeps running; return `Break(error)` to stop the loop and
    /// hand the error back from [`PeriodicAlarmLoop::start`].
    fn on_error(&mut self, ctx: &TickContext, error: Self::Error) -> ControlFlow<Self::Error> {
        let _ = (ctx, error);
        ControlFlow::Continue(())
    }
}

impl<F, E> TickHandler for F
where
    F: FnMut(&TickContext) -> Result<(), E>,
    E: fmt::Display,
{
    type Error = E;

    fn on_tick(&mut self, ctx: &TickContext) -> Result<(), E> {
        self(ctx)
    }
}

/// Handler paired with an owner-supplied error policy.
pub struct WithErrorPolicy<H, G> {
    handler: H,
    policy: G,
}

impl<H, G> TickHandler for WithErrorPolicy<H, G>
where
    H: TickHandler,
    G: FnMut(&TickContext, H::Error) -> ControlFlow<H::Error>,
{
    type Error = H::Error;

    fn on_tick(&mut self, ctx: &TickContext) -> Result<(), Self::Error> {
        self.handler.on_tick(ctx)
    }

    fn on_error(&mut self, ctx: &TickContext, error: Self::Error) -> ControlFlow<Self::Error> {
        (self.policy)(ctx, error)
    }
}

/// Attach an error policy to a handler.
pub fn with_error_policy<H, G>(handler: H, policy: G) -> WithErrorPolicy<H, G>
where
    H: TickHandler,
    G: FnMut(&TickContext, H::Error) -> ControlFlow<H::Error>,
{
    WithErrorPolicy { handler, policy }
}

/// Reasons a loop run ended abnormally.
#[derive(Debug, Error)]
pub enum LoopError<E> {
    /// Startup, alarm, or lifecycle failure.
    #[error(transparent)]
    Scheduler(#[from] PhaselockError),

    /// A tick failed and the handler's policy chose to stop.
    #[error("tick callback failed: {0}")]
    Callback(E),
}

/// Summary of a finished loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    /// Ticks delivered to the handler.
    pub ticks: u64,
    /// Lifecycle state after the run.
    pub final_state: LoopState,
    /// Wake-latency statistics.
    pub metrics: MetricsSnapshot,
}

/// Fixed-period, phase-locked alarm loop.
pub struct PeriodicAlarmLoop<P: AlarmPlatform + 'static, H: TickHandler> {
    cell: Arc<AlarmCell<P>>,
    handler: H,
    state: StateMachine,
    period: Period,
    offset_us: i64,
    alarm_name: String,
    max_ticks: u64,
    ticks: u64,
    metrics: TickMetrics,
}

impl<P: AlarmPlatform + 'static, H: TickHandler> PeriodicAlarmLoop<P, H> {
    /// Create a loop with the given period in microseconds.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::InvalidPeriod`] if `period_us <= 0`; no alarm
    /// is touched in that case.
    pub fn new(period_us: i64, platform: P, handler: H) -> PhaselockResult<Self> {
        PeriodicLoopBuilder::new(platform, handler)
            .period_us(period_us)
            .build()
    }

    /// Handle that stops this loop from any thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        let target = Arc::clone(&self.cell) as Arc<dyn StopTarget>;
        StopHandle::new(target)
    }

    /// Stop the loop. Idempotent.
    pub fn stop(&self) {
        self.cell.request_stop();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state.state()
    }

    /// Tick period.
    #[must_use]
    pub fn period(&self) -> Period {
        self.period
    }

    /// Grid offset in microseconds.
    #[must_use]
    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    /// Ticks delivered so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Wake-latency metrics.
    #[must_use]
    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    /// The underlying platform.
    #[must_use]
    pub fn platform(&self) -> &P {
        &self.cell.platform
    }

    /// Run the loop on the calling thread until stopped.
    ///
    /// A loop runs at most once; calling `start` again fails with
    /// [`PhaselockError::InvalidStateTransition`].
    ///
    /// # Errors
    ///
    /// - [`PhaselockError::StartupFailure`] if the alarm cannot be acquired.
    /// - [`PhaselockError::AlarmFailure`] if arming or waiting fails.
    /// - [`LoopError::Callback`] if the handler's error policy stopped the loop.
    pub fn start(&mut self) -> Result<LoopReport, LoopError<H::Error>> {
        if self.state.state() != LoopState::Idle {
            return Err(PhaselockError::InvalidStateTransition {
                from: self.state.state().to_string(),
                to: LoopState::Running.to_string(),
            }
            .into());
        }

        let cell = Arc::clone(&self.cell);
        let guard = match AlarmGuard::acquire(&cell, &self.alarm_name) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!(name = %self.alarm_name, "Stop requested before start, not arming");
                self.state.transition(LoopState::Stopped)?;
                return Ok(self.report());
            }
            Err(e) => {
                error!(error = %e, name = %self.alarm_name, "Failed to acquire alarm");
                self.state.enter_fault();
                return Err(e.into());
            }
        };

        self.state.transition(LoopState::Running)?;

        let epoch = cell.platform.now();
        let mut schedule = ScheduleState::new(epoch, self.offset_us, self.period);
        info!(
            name = %self.alarm_name,
            epoch_us = epoch.as_micros(),
            period_us = self.period.as_micros(),
            offset_us = self.offset_us,
            "Starting periodic loop"
        );

        let result = self.run_cycles(&guard, &mut schedule);
        drop(guard);

        match &result {
            Err(LoopError::Scheduler(e)) => {
                error!(error = %e, ticks = self.ticks, "Periodic loop faulted");
                self.state.enter_fault();
            }
            Ok(()) | Err(LoopError::Callback(_)) => {
                self.state.transition(LoopState::Stopped)?;
            }
        }

        info!(
            name = %self.alarm_name,
            ticks = self.ticks,
            final_state = %self.state.state(),
            "Periodic loop exited"
        );

        result.map(|()| self.report())
    }

    fn run_cycles(
        &mut self,
        guard: &AlarmGuard<'_, P>,
        schedule: &mut ScheduleState,
    ) -> Result<(), LoopError<H::Error>> {
        let cell = Arc::clone(&self.cell);
        let platform = &cell.platform;

        loop {
            if self.max_ticks > 0 && self.ticks >= self.max_ticks {
                debug!(max_ticks = self.max_ticks, "Tick limit reached");
                return Ok(());
            }
            if cell.is_stop_requested() {
                return Ok(());
            }

            let now = platform.now();
            let target = schedule.next_target(now)?;
            let skipped_slots = schedule.skipped_before(target);

            trace!(
                now_us = now.as_micros(),
                target_us = target.as_micros(),
                "Arming alarm"
            );

            let woke_at = match platform.arm_and_wait(guard.id(), target)? {
                WaitOutcome::Fired(woke_at) => woke_at,
                WaitOutcome::Cancelled => {
                    debug!(ticks = self.ticks, "Alarm wait cancelled");
                    return Ok(());
                }
            };

            self.ticks += 1;
            let ctx = TickContext {
                tick: self.ticks,
                target,
                woke_at,
                skipped_slots,
            };

            if self.metrics.record_tick(ctx.latency_us(), skipped_slots) {
                warn!(
                    tick = ctx.tick,
                    latency_us = ctx.latency_us(),
                    threshold_us = self.metrics.late_threshold_us(),
                    "Late wake"
                );
            }
            if skipped_slots > 0 {
                warn!(
                    tick = ctx.tick,
                    skipped_slots,
                    target_us = target.as_micros(),
                    "Iteration overran, skipping grid slots"
                );
            }

            if let Err(e) = self.handler.on_tick(&ctx) {
                self.metrics.record_callback_failure();
                warn!(tick = ctx.tick, error = %e, "Tick callback failed");
                if let ControlFlow::Break(e) = self.handler.on_error(&ctx, e) {
                    return Err(LoopError::Callback(e));
                }
            }

            schedule.advance(target)?;
        }
    }

    fn report(&self) -> LoopReport {
        LoopReport {
            ticks: self.ticks,
            final_state: self.state.state(),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl<P: AlarmPlatform + 'static, H: TickHandler> fmt::Debug for PeriodicAlarmLoop<P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicAlarmLoop")
            .field("alarm_name", &self.alarm_name)
            .field("period", &self.period)
            .field("offset_us", &self.offset_us)
            .field("state", &self.state.state())
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a periodic loop.
pub struct PeriodicLoopBuilder<P, H> {
    platform: P,
    handler: H,
    period_us: i64,
    offset_us: i64,
    alarm_name: String,
    max_ticks: u64,
    histogram_size: usize,
    late_threshold_us: u64,
}

impl<P: AlarmPlatform + 'static, H: TickHandler> PeriodicLoopBuilder<P, H> {
    /// Create a new builder with default 20 ms period.
    pub fn new(platform: P, handler: H) -> Self {
        Self {
            platform,
            handler,
            period_us: DEFAULT_PERIOD_US,
            offset_us: 0,
            alarm_name: String::from("PeriodicLoop"),
            max_ticks: 0,
            histogram_size: DEFAULT_HISTOGRAM_SIZE,
            late_threshold_us: DEFAULT_LATE_THRESHOLD_US,
        }
    }

    /// Set the period in microseconds.
    #[must_use]
    pub fn period_us(mut self, period_us: i64) -> Self {
        self.period_us = period_us;
        self
    }

    /// Set the fixed grid offset in microseconds.
    #[must_use]
    pub fn offset_us(mut self, offset_us: i64) -> Self {
        self.offset_us = offset_us;
        self
    }

    /// Set the name registered with the platform alarm.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.alarm_name = name.into();
        self
    }

    /// Stop after `max_ticks` ticks (0 = unbounded).
    #[must_use]
    pub fn max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    /// Set the wake-latency ring buffer size.
    #[must_use]
    pub fn histogram_size(mut self, size: usize) -> Self {
        self.histogram_size = size;
        self
    }

    /// Set the late-tick threshold in microseconds.
    #[must_use]
    pub fn late_threshold_us(mut self, threshold_us: u64) -> Self {
        self.late_threshold_us = threshold_us;
        self
    }

    /// Apply a full loop configuration.
    ///
    /// # Errors
    ///
    /// Returns the configuration's validation error.
    pub fn config(mut self, config: &LoopConfig) -> PhaselockResult<Self> {
        self.period_us = config.validated_period()?.as_micros();
        self.offset_us = config.offset_us;
        self.alarm_name.clone_from(&config.alarm_name);
        self.max_ticks = config.max_ticks;
        self.histogram_size = config.metrics.histogram_size;
        self.late_threshold_us = config.late_threshold_us();
        Ok(self)
    }

    /// Build the loop.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::InvalidPeriod`] if the period is not positive.
    pub fn build(self) -> PhaselockResult<PeriodicAlarmLoop<P, H>> {
        let period = Period::from_micros(self.period_us)?;

        Ok(PeriodicAlarmLoop {
            cell: Arc::new(AlarmCell::new(self.platform)),
            handler: self.handler,
            state: StateMachine::new(),
            period,
            offset_us: self.offset_us,
            alarm_name: self.alarm_name,
            max_ticks: self.max_ticks,
            ticks: 0,
            metrics: TickMetrics::new(self.histogram_size, self.late_threshold_us),
        })
    }
}
