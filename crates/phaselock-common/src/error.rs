use thiserror::Error;

/// Errors raised by the periodic alarm loop and its platform layer.
///
/// Cancellation through `stop()` is a normal outcome and is not represented here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhaselockError {
    /// A loop period of zero or less was supplied.
    #[error("invalid period: {period_us}us (period must be strictly positive)")]
    InvalidPeriod {
        /// Rejected period in microseconds.
        period_us: i64,
    },

    /// The alarm resource could not be acquired when the loop started.
    #[error("startup failure: {0}")]
    StartupFailure(String),

    /// The platform could not arm or observe the alarm.
    #[error("alarm failure: {0}")]
    AlarmFailure(String),

    /// Expiration arithmetic left the representable microsecond range.
    #[error("time arithmetic overflow")]
    TimeOverflow,

    /// Invalid lifecycle transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for phaselock operations.
pub type PhaselockResult<T> = Result<T, PhaselockError>;
