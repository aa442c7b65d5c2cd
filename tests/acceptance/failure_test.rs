//! Failure-path acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Invalid periods are rejected before any alarm is touched
//! - Alarm acquisition and arm failures are fatal and reported
//! - Callback errors are never retried and reach the owner's policy
//! - The alarm is released on every exit path, including panics

use phaselock_common::{LoopState, PhaselockError};
use phaselock_runtime::{
    with_error_policy, LoopError, PeriodicAlarmLoop, PeriodicLoopBuilder, SimulatedPlatform,
    TickContext,
};
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn test_negative_period_rejected() {
    let platform = Arc::new(SimulatedPlatform::new(0));
    let result = PeriodicAlarmLoop::new(-20_000, Arc::clone(&platform), |_: &TickContext| {
        Ok::<(), Infallible>(())
    });

    assert!(matches!(
        result,
        Err(PhaselockError::InvalidPeriod { period_us: -20_000 })
    ));
    assert!(platform.armed_targets().is_empty());
    assert_eq!(platform.alarm_counts(), (0, 0));
}

#[test]
fn test_acquire_failure_is_startup_failure() {
    let platform = Arc::new(SimulatedPlatform::new(0).failing_acquire());
    let mut periodic = PeriodicAlarmLoop::new(20_000, Arc::clone(&platform), |_: &TickContext| {
        Ok::<(), Infallible>(())
    })
    .unwrap();

    let result = periodic.start();

    assert!(matches!(
        result,
        Err(LoopError::Scheduler(PhaselockError::StartupFailure(_)))
    ));
    assert_eq!(periodic.state(), LoopState::Faulted);
    assert!(platform.armed_targets().is_empty());
}

#[test]
fn test_arm_failure_faults_loop_and_releases_alarm() {
    let platform = Arc::new(SimulatedPlatform::new(0).failing_arm_after(3));
    let calls = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&calls);
    let mut periodic = PeriodicAlarmLoop::new(20_000, Arc::clone(&platform), move |_: &TickContext| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok::<(), Infallible>(())
    })
    .unwrap();

    let result = periodic.start();

    assert!(matches!(
        result,
        Err(LoopError::Scheduler(PhaselockError::AlarmFailure(_)))
    ));
    assert_eq!(calls.load(Ordering::Relaxed), 3);
    assert_eq!(periodic.state(), LoopState::Faulted);
    assert_eq!(platform.alarm_counts(), (1, 1));
}

#[test]
fn test_callback_errors_continue_by_default() {
    let platform = Arc::new(SimulatedPlatform::new(0));
    let calls = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&calls);
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        counter.fetch_add(1, Ordering::Relaxed);
        if ctx.tick % 2 == 0 {
            return Err(format!("sensor read failed on tick {}", ctx.tick));
        }
        Ok(())
    })
    .max_ticks(6)
    .build()
    .unwrap();

    let report = periodic.start().unwrap();

    // Each failing tick ran exactly once: no retries.
    assert_eq!(calls.load(Ordering::Relaxed), 6);
    assert_eq!(report.ticks, 6);
    assert_eq!(report.metrics.callback_failures, 3);
    assert_eq!(platform.armed_targets().len(), 6);
}

#[test]
fn test_error_policy_stop_returns_error_verbatim() {
    let platform = Arc::new(SimulatedPlatform::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let policy_seen = Arc::clone(&seen);
    let handler = with_error_policy(
        |ctx: &TickContext| {
            if ctx.tick == 4 {
                return Err(String::from("actuator fault"));
            }
            Ok(())
        },
        move |ctx: &TickContext, error: String| {
            policy_seen.lock().unwrap().push(ctx.tick);
            ControlFlow::Break(error)
        },
    );

    let mut periodic = PeriodicAlarmLoop::new(20_000, Arc::clone(&platform), handler).unwrap();
    let result = periodic.start();

    match result {
        Err(LoopError::Callback(error)) => assert_eq!(error, "actuator fault"),
        other => panic!("expected callback error, got {other:?}"),
    }
    assert_eq!(*seen.lock().unwrap(), vec![4]);
    assert_eq!(periodic.state(), LoopState::Stopped);
    assert_eq!(periodic.ticks(), 4);
    assert_eq!(platform.active_alarms(), 0);
}

#[test]
fn test_panicking_callback_releases_alarm() {
    let platform = Arc::new(SimulatedPlatform::new(0));
    let mut periodic = PeriodicAlarmLoop::new(20_000, Arc::clone(&platform), |ctx: &TickContext| {
        assert!(ctx.tick < 2, "callback blew up");
        Ok::<(), Infallible>(())
    })
    .unwrap();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| periodic.start()));

    assert!(outcome.is_err());
    assert_eq!(platform.alarm_counts(), (1, 1));
    assert_eq!(platform.active_alarms(), 0);
}
