//! Rate limiting on top of the admission gateway.
//!
//! - [`TokenBucket`]: a handle on one shared bucket, the usual entry point.
//! - [`RateLimiter`]: the seam the middleware talks to.
//! - [`RateLimitLayer`]: tower middleware that turns decisions into [`ThrottleError`]s.
//!
//! [`ThrottleError`]: crate::ThrottleError

use crate::error::AdmissionError;
use std::time::Duration;

pub mod bucket;
pub mod middleware;
pub use bucket::TokenBucket;
pub use middleware::{RateLimitLayer, RateLimitService};

/// Outcome of one admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Tokens were consumed.
    Allowed {
        /// Tokens left after this grant. Negative for a continuous bucket that granted
        /// ahead of replenishment.
        remaining: i64,
        /// How long the caller must wait before acting on the grant. Always zero for the
        /// fixed-window policy.
        wait: Duration,
    },
    /// Nothing was consumed.
    Denied {
        /// Tokens in the bucket when it refused.
        remaining: i64,
        /// Projected wait that exceeded the bound (continuous policy only).
        wait: Duration,
    },
    /// Another caller holds the bucket's lock. Nothing was read or consumed.
    Locked,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Decision::Denied { .. })
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Decision::Locked)
    }

    /// Token count reported with the decision; `None` when locked.
    pub fn remaining(&self) -> Option<i64> {
        match self {
            Decision::Allowed { remaining, .. } | Decision::Denied { remaining, .. } => {
                Some(*remaining)
            }
            Decision::Locked => None,
        }
    }

    /// Reported wait, zero when locked.
    pub fn wait(&self) -> Duration {
        match self {
            Decision::Allowed { wait, .. } | Decision::Denied { wait, .. } => *wait,
            Decision::Locked => Duration::ZERO,
        }
    }
}

/// Anything that can decide whether `tokens` may be consumed now.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self, tokens: u64) -> Result<Decision, AdmissionError>;
}
