//! Lifecycle state machine for a periodic alarm loop.
//!
//! State transitions:
//! IDLE → RUNNING → STOPPED | FAULTED
//!
//! A loop never returns to IDLE; restarting requires a fresh instance.

use crate::error::{PhaselockError, PhaselockResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a periodic alarm loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    /// Constructed, not yet started.
    #[default]
    Idle,
    /// Owning thread is inside the wake/callback cycle.
    Running,
    /// Exited through cancellation or owner policy.
    Stopped,
    /// Exited because the alarm could not be acquired or armed.
    Faulted,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Faulted => write!(f, "FAULTED"),
        }
    }
}

impl LoopState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: LoopState) -> bool {
        use LoopState::{Faulted, Idle, Running, Stopped};

        matches!(
            (self, target),
            (Idle, Running)
                // stop() before start()
                | (Idle, Stopped)
                // alarm acquisition failed
                | (Idle, Faulted)
                | (Running, Stopped)
                | (Running, Faulted)
        )
    }

    /// Returns true once the loop has exited and cannot run again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

/// State machine wrapper enforcing valid transitions.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: LoopState,
}

impl StateMachine {
    /// Create a new state machine starting in IDLE.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.current
    }

    /// Attempt a state transition.
    ///
    /// # Errors
    ///
    /// Returns [`PhaselockError::InvalidStateTransition`] when the move is not allowed.
    pub fn transition(&mut self, target: LoopState) -> PhaselockResult<()> {
        if self.current.can_transition_to(target) {
            self.current = target;
            Ok(())
        } else {
            Err(PhaselockError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Move to FAULTED if the current state allows it.
    pub fn enter_fault(&mut self) {
        if self.current.can_transition_to(LoopState::Faulted) {
            self.current = LoopState::Faulted;
        }
    }
}
