use thiserror::Error;

use crate::domain::channel::IndexState;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid channel transition from {from:?} to {to:?}")]
    InvalidChannelTransition { from: IndexState, to: IndexState },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Application-level taxonomy. `RateLimited` is retryable and bounded,
/// `Access` is permanent for one channel, `Data` is local and recoverable,
/// everything else aborts the run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("rate limited after {attempts} attempts (last wait {last_wait_secs}s)")]
    RateLimited { attempts: u32, last_wait_secs: u64 },
    #[error("access denied: {0}")]
    Access(String),
    #[error("malformed upstream data: {0}")]
    Data(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Channel-scoped errors are contained to the channel; the run continues.
    pub fn is_channel_scoped(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Access(_) | Self::Data(_))
    }

    /// The work is still eligible after this error and may be retried on a
    /// later run.
    pub fn is_deferrable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
