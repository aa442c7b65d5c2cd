//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Recording tick contexts from inside a running loop
//! - Handing a stop handle to a callback built before the loop exists

#![allow(dead_code)] // Not every suite uses every helper

use phaselock_runtime::{StopHandle, TickContext};
use std::sync::{Arc, Mutex, OnceLock};

/// Shared record of every tick a handler observed.
#[derive(Debug, Clone, Default)]
pub struct TickLog {
    ticks: Arc<Mutex<Vec<TickContext>>>,
}

impl TickLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one tick.
    pub fn push(&self, ctx: &TickContext) {
        self.ticks.lock().unwrap().push(*ctx);
    }

    /// Snapshot of recorded ticks.
    pub fn ticks(&self) -> Vec<TickContext> {
        self.ticks.lock().unwrap().clone()
    }

    /// Wake times in microseconds.
    pub fn wake_times_us(&self) -> Vec<i64> {
        self.ticks().iter().map(|c| c.woke_at.as_micros()).collect()
    }

    /// Targets in microseconds.
    pub fn targets_us(&self) -> Vec<i64> {
        self.ticks().iter().map(|c| c.target.as_micros()).collect()
    }
}

/// Late-bound stop handle for callbacks that stop their own loop.
#[derive(Debug, Clone, Default)]
pub struct StopSlot {
    handle: Arc<OnceLock<StopHandle>>,
}

impl StopSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the loop's handle.
    pub fn set(&self, handle: StopHandle) {
        self.handle
            .set(handle)
            .expect("stop handle installed twice");
    }

    /// Stop the loop if the handle is installed.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.get() {
            handle.stop();
        }
    }
}

/// Grid of `count` targets starting one period after `epoch`.
pub fn grid(epoch: i64, offset: i64, period: i64, count: usize) -> Vec<i64> {
    (1..=count as i64)
        .map(|n| epoch + offset + n * period)
        .collect()
}
