//! Phase-lock and drift acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A 20 ms loop started at t=0 fires at 20000, 40000, 60000, ... until stopped
//! - An iteration that runs past the next slot skips it and stays on the grid
//! - Wake skid shows up as latency only; targets never shift
//! - A negative offset moves the whole grid, not just the first tick
//! - A platform that reports early wakes never gets a slot re-armed

use super::common::{grid, StopSlot, TickLog};
use phaselock_common::LoopState;
use phaselock_runtime::{PeriodicLoopBuilder, SimulatedPlatform, TickContext};
use std::convert::Infallible;
use std::sync::Arc;

#[test]
fn test_twenty_ms_grid_until_stop() {
    let platform = Arc::new(SimulatedPlatform::new(0));
    let log = TickLog::new();
    let stop = StopSlot::new();

    let handler_log = log.clone();
    let handler_stop = stop.clone();
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        if ctx.tick == 50 {
            handler_stop.stop();
        }
        Ok::<(), Infallible>(())
    })
    .period_us(20_000)
    .build()
    .unwrap();
    stop.set(periodic.stop_handle());

    let report = periodic.start().unwrap();

    assert_eq!(report.ticks, 50);
    assert_eq!(report.final_state, LoopState::Stopped);
    assert_eq!(log.wake_times_us(), grid(0, 0, 20_000, 50));
    assert_eq!(report.metrics.skipped_slots, 0);
    assert_eq!(report.metrics.max_latency_us, Some(0));

    // The stop arrived before the 51st wait; nothing was armed after it.
    assert_eq!(platform.armed_targets().len(), 50);
    assert_eq!(platform.active_alarms(), 0);
}

#[test]
fn test_long_iteration_skips_slot_and_stays_on_grid() {
    let platform = Arc::new(SimulatedPlatform::new(0));
    let log = TickLog::new();

    let handler_log = log.clone();
    let clock = Arc::clone(&platform);
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        if ctx.tick == 1 {
            // First callback takes 35 ms, longer than one period.
            clock.advance(35_000);
        }
        Ok::<(), Infallible>(())
    })
    .period_us(20_000)
    .max_ticks(4)
    .build()
    .unwrap();

    let report = periodic.start().unwrap();

    // Clock was at 55000 when re-arming: 40000 is skipped, not 55000 + 20000.
    assert_eq!(log.targets_us(), vec![20_000, 60_000, 80_000, 100_000]);
    assert_eq!(log.ticks()[1].skipped_slots, 1);
    assert_eq!(report.metrics.skipped_slots, 1);
}

#[test]
fn test_repeated_overruns_never_accumulate_drift() {
    let platform = Arc::new(SimulatedPlatform::new(0));
    let log = TickLog::new();

    let handler_log = log.clone();
    let clock = Arc::clone(&platform);
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        // Every iteration costs 1.3 periods.
        clock.advance(13_000);
        Ok::<(), Infallible>(())
    })
    .period_us(10_000)
    .max_ticks(20)
    .build()
    .unwrap();

    periodic.start().unwrap();

    for target in log.targets_us() {
        assert_eq!(target % 10_000, 0, "target {target} left the grid");
    }
}

#[test]
fn test_wake_skid_is_latency_not_drift() {
    let platform = Arc::new(SimulatedPlatform::new(0).with_wake_skid(60));
    let log = TickLog::new();

    let handler_log = log.clone();
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        Ok::<(), Infallible>(())
    })
    .period_us(20_000)
    .max_ticks(100)
    .build()
    .unwrap();

    let report = periodic.start().unwrap();

    assert_eq!(log.targets_us(), grid(0, 0, 20_000, 100));
    assert!(log.ticks().iter().all(|c| c.latency_us() == 60));
    assert_eq!(report.metrics.mean_latency_us, Some(60));
}

#[test]
fn test_late_start_anchors_grid_at_start_epoch() {
    let platform = Arc::new(SimulatedPlatform::new(3_418_017));
    let log = TickLog::new();

    let handler_log = log.clone();
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        Ok::<(), Infallible>(())
    })
    .period_us(20_000)
    .max_ticks(3)
    .build()
    .unwrap();

    periodic.start().unwrap();

    assert_eq!(log.targets_us(), vec![3_438_017, 3_458_017, 3_478_017]);
}

#[test]
fn test_negative_offset_shifts_entire_grid() {
    let platform = Arc::new(SimulatedPlatform::new(1_000));
    let log = TickLog::new();

    let handler_log = log.clone();
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        Ok::<(), Infallible>(())
    })
    .period_us(100)
    .offset_us(-50)
    .max_ticks(5)
    .build()
    .unwrap();

    periodic.start().unwrap();

    assert_eq!(log.targets_us(), vec![1_050, 1_150, 1_250, 1_350, 1_450]);
}

#[test]
fn test_early_wake_never_repeats_slot() {
    // Every wake is reported 10 us before its target.
    let platform = Arc::new(SimulatedPlatform::new(0).with_wake_skid(-10));
    let log = TickLog::new();

    let handler_log = log.clone();
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        Ok::<(), Infallible>(())
    })
    .period_us(100)
    .max_ticks(4)
    .build()
    .unwrap();

    let report = periodic.start().unwrap();

    assert_eq!(log.targets_us(), vec![100, 200, 300, 400]);
    assert_eq!(log.wake_times_us(), vec![90, 190, 290, 390]);
    assert_eq!(report.metrics.skipped_slots, 0);
    assert_eq!(report.metrics.max_latency_us, Some(0));
}
