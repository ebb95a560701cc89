//! Error types for admission decisions and the throttling middleware.
//!
//! `Denied` and `Locked` are not errors: they are ordinary [`Decision`](crate::Decision)
//! values. Everything here means the decision itself could not be made.
use crate::policy::PolicyError;
use crate::substrate::SubstrateError;
use std::fmt;
use std::time::Duration;

/// Failure to reach an admission decision.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum AdmissionError {
    /// The substrate refused to register a script.
    #[error("script `{script}` could not be registered: {reason}")]
    Registration {
        /// Stable name of the script.
        script: &'static str,
        /// Reason reported by the substrate.
        reason: String,
    },
    /// Connectivity or execution failure inside the substrate.
    #[error("substrate unavailable: {reason}")]
    Unavailable {
        /// Reason reported by the substrate.
        reason: String,
    },
    /// The positional reply did not match the shape the script promises.
    ///
    /// Usually a version mismatch between this crate and the scripts loaded in the store.
    /// Never interpret this as a deny.
    #[error("contract violation in `{script}`: {reason}")]
    ContractViolation {
        /// Stable name of the script.
        script: &'static str,
        /// What was wrong with the reply.
        reason: String,
    },
    /// The continuous policy observed its last replenishment in the future.
    #[error("clock skew on `{key}`: replenished {}s in the future", .elapsed_secs.unsigned_abs())]
    ClockSkew {
        /// Bucket key.
        key: String,
        /// `now - last_replenished_at`, always negative.
        elapsed_secs: i64,
    },
    /// The request or policy was rejected before reaching the substrate.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] PolicyError),
}

impl AdmissionError {
    /// Check if the substrate could not be reached or could not register a script.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Registration { .. })
    }

    /// Check if the reply shape was wrong.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation { .. })
    }

    /// Check if the continuous policy saw time move backwards.
    pub fn is_clock_skew(&self) -> bool {
        matches!(self, Self::ClockSkew { .. })
    }
}

impl From<SubstrateError> for AdmissionError {
    fn from(err: SubstrateError) -> Self {
        match err {
            SubstrateError::Registration { script, reason } => {
                Self::Registration { script, reason }
            }
            SubstrateError::Malformed { script, reason } => {
                Self::ContractViolation { script, reason }
            }
            SubstrateError::UnknownScript { id } => Self::Registration {
                script: "<unknown>",
                reason: format!("script {id} not loaded"),
            },
            SubstrateError::Unavailable { reason } | SubstrateError::Execution { reason } => {
                Self::Unavailable { reason }
            }
        }
    }
}

/// Error returned by [`RateLimitService`](crate::RateLimitService).
#[derive(Debug, Clone)]
pub enum ThrottleError<E> {
    /// The bucket had no room for the request.
    RateLimited { wait: Duration },
    /// Another caller holds the bucket's lock.
    Locked,
    /// The admission decision could not be made.
    Admission(AdmissionError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ThrottleError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { wait } if wait.is_zero() => write!(f, "rate limited"),
            Self::RateLimited { wait } => write!(f, "rate limited (retry after {:?})", wait),
            Self::Locked => write!(f, "bucket locked by another caller"),
            Self::Admission(e) => write!(f, "admission failed: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ThrottleError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Admission(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ThrottleError<E> {
    /// Check if the request was turned away by the bucket.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Check if the request hit a held lock.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }

    /// Suggested wait before retrying, if the limiter projected one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
