//! Cancellation and real-clock acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - `stop()` from another thread interrupts a wait that would block for seconds
//! - The cancelled wake never reaches the callback
//! - `stop()` is idempotent and safe to race from many threads
//! - The host platform fires ticks at or after their targets

use super::common::{StopSlot, TickLog};
use phaselock_common::LoopState;
use phaselock_runtime::{HostPlatform, PeriodicAlarmLoop, PeriodicLoopBuilder, TickContext};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_stop_interrupts_blocked_host_wait() {
    let platform = Arc::new(HostPlatform::new().unwrap());
    let calls = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&calls);
    // Ten second period: the first wait would block far longer than the test.
    let mut periodic = PeriodicAlarmLoop::new(10_000_000, Arc::clone(&platform), move |_: &TickContext| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok::<(), Infallible>(())
    })
    .unwrap();

    let stop = periodic.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stop.stop();
    });

    let started = Instant::now();
    let report = periodic.start().unwrap();
    stopper.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.ticks, 0);
    assert_eq!(report.final_state, LoopState::Stopped);
    assert_eq!(calls.load(Ordering::Relaxed), 0);
    assert_eq!(platform.active_alarms(), 0);
}

#[test]
fn test_concurrent_stops_are_idempotent() {
    let platform = Arc::new(HostPlatform::new().unwrap());
    let mut periodic = PeriodicAlarmLoop::new(10_000_000, Arc::clone(&platform), |_: &TickContext| {
        Ok::<(), Infallible>(())
    })
    .unwrap();

    let stoppers: Vec<_> = (0..8)
        .map(|i| {
            let stop = periodic.stop_handle();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10 * i));
                stop.stop();
                stop.stop();
            })
        })
        .collect();

    let report = periodic.start().unwrap();
    for stopper in stoppers {
        stopper.join().unwrap();
    }

    assert_eq!(report.final_state, LoopState::Stopped);
    assert!(periodic.stop_handle().is_stopped());
    periodic.stop();
    assert_eq!(platform.active_alarms(), 0);
}

#[test]
fn test_host_ticks_land_on_grid() {
    let platform = Arc::new(HostPlatform::new().unwrap());
    let log = TickLog::new();

    let handler_log = log.clone();
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        Ok::<(), Infallible>(())
    })
    .period_us(5_000)
    .max_ticks(5)
    .name("HostGrid")
    .build()
    .unwrap();

    let report = periodic.start().unwrap();
    assert_eq!(report.ticks, 5);

    let ticks = log.ticks();
    for ctx in &ticks {
        assert!(ctx.woke_at >= ctx.target, "tick {} fired early", ctx.tick);
    }
    for pair in ticks.windows(2) {
        let gap = pair[1].target.micros_since(pair[0].target);
        assert!(gap > 0 && gap % 5_000 == 0, "targets left the grid: gap {gap}");
    }
}

#[test]
fn test_host_stop_from_callback() {
    let platform = Arc::new(HostPlatform::new().unwrap());
    let log = TickLog::new();
    let stop = StopSlot::new();

    let handler_log = log.clone();
    let handler_stop = stop.clone();
    let mut periodic = PeriodicLoopBuilder::new(Arc::clone(&platform), move |ctx: &TickContext| {
        handler_log.push(ctx);
        if ctx.tick == 3 {
            handler_stop.stop();
        }
        Ok::<(), Infallible>(())
    })
    .period_us(2_000)
    .build()
    .unwrap();
    stop.set(periodic.stop_handle());

    let report = periodic.start().unwrap();

    assert_eq!(report.ticks, 3);
    assert_eq!(log.ticks().len(), 3);
    assert_eq!(platform.active_alarms(), 0);
}
