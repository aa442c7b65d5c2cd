//! One-shot alarm skid probe.
//!
//! Arms a single alarm a fixed lead time ahead and reports the scheduled
//! time, the wake time the alarm reported, and a clock reading taken right
//! after the wake. Useful for sizing a loop's negative offset.

use phaselock_common::error::{PhaselockError, PhaselockResult};
use phaselock_runtime::{AlarmPlatform, WaitOutcome};
use serde::Serialize;
use tracing::info;

/// Clock readings from one probe shot, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// Clock reading when the alarm was armed.
    pub armed_at_us: i64,
    /// Absolute target the alarm was armed for.
    pub scheduled_us: i64,
    /// Wake time reported by the alarm.
    pub woke_at_us: i64,
    /// Clock reading immediately after the wait returned.
    pub after_wake_us: i64,
}

impl ProbeReport {
    /// Wake time minus scheduled time.
    pub fn skid_us(&self) -> i64 {
        self.woke_at_us.saturating_sub(self.scheduled_us)
    }
}

/// Arm one alarm `lead_us` ahead of now and wait for it.
///
/// The alarm is released before returning, whatever the outcome.
///
/// # Errors
///
/// Fails if the alarm cannot be acquired or armed, or if the wait was
/// cancelled.
pub fn run_probe<P: AlarmPlatform>(platform: &P, lead_us: i64) -> PhaselockResult<ProbeReport> {
    let id = platform.acquire("Probe")?;

    let armed_at = platform.now();
    let outcome = armed_at
        .checked_add_us(lead_us)
        .and_then(|target| Ok((target, platform.arm_and_wait(id, target)?)));
    let after_wake = platform.now();
    platform.release(id);

    let (target, woke_at) = match outcome? {
        (target, WaitOutcome::Fired(woke_at)) => (target, woke_at),
        (_, WaitOutcome::Cancelled) => {
            return Err(PhaselockError::AlarmFailure(format!(
                "probe alarm {id} cancelled"
            )))
        }
    };

    let report = ProbeReport {
        armed_at_us: armed_at.as_micros(),
        scheduled_us: target.as_micros(),
        woke_at_us: woke_at.as_micros(),
        after_wake_us: after_wake.as_micros(),
    };
    info!(
        scheduled_us = report.scheduled_us,
        woke_at_us = report.woke_at_us,
        after_wake_us = report.after_wake_us,
        skid_us = report.skid_us(),
        "Probe alarm fired"
    );
    Ok(report)
}
