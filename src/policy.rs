//! Admission policies, requests and bucket key naming.
//!
//! One engine, one configuration enum: the policy decides which script the gateway runs.
//!
//! ```rust
//! use tollgate::policy::Policy;
//!
//! let window = Policy::fixed_window(10, 30).unwrap().with_lock(30).unwrap();
//! assert!(window.uses_lock());
//!
//! let smooth = Policy::continuous(10, 0.33, 10).unwrap();
//! assert_eq!(smooth.capacity(), 10);
//! ```

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Default reset window for the fixed-window policy, in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 30;

/// Default safety TTL for the mutual-exclusion lock, in seconds.
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;

/// Suffix of the key holding the continuous policy's last replenishment timestamp.
pub const LAST_REPLENISHED_SUFFIX: &str = ":last_replenished";

/// Suffix of the key holding the bucket's lock.
pub const LOCK_SUFFIX: &str = ":lock";

/// Errors produced when validating policies, requests or keys.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum PolicyError {
    /// Capacity must be > 0 and fit in a signed 64-bit counter.
    #[error("capacity must be between 1 and i64::MAX (got {provided})")]
    InvalidCapacity {
        /// Value provided by caller.
        provided: u64,
    },
    /// Fixed window must be at least one second.
    #[error("window must be > 0 seconds (got {provided})")]
    InvalidWindow {
        /// Value provided by caller.
        provided: u64,
    },
    /// Lock TTL must be at least one second.
    #[error("lock ttl must be > 0 seconds (got {provided})")]
    InvalidLockTtl {
        /// Value provided by caller.
        provided: u64,
    },
    /// Replenishment rate must be finite and positive.
    #[error("replenishment rate must be finite and > 0 (got {provided})")]
    InvalidRate {
        /// Value provided by caller.
        provided: f64,
    },
    /// Requests must ask for at least one token.
    #[error("requested tokens must be >= 1 (got {provided})")]
    InvalidTokens {
        /// Value provided by caller.
        provided: u64,
    },
    /// Only fixed-window policies can take the bucket's lock.
    #[error("the continuous policy has no lock variant")]
    LockUnsupported,
    /// Resource keys must be non-empty and printable.
    #[error("invalid resource key: {reason}")]
    InvalidKey {
        /// What was wrong with the key.
        reason: &'static str,
    },
}

/// How a bucket refills, and whether a grant also takes the bucket's lock.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Policy {
    /// Bucket resets to `capacity` once its TTL of `window_secs` lapses.
    FixedWindow {
        capacity: u64,
        window_secs: u64,
        /// `Some(ttl)` makes every grant take the bucket's lock with that safety TTL.
        lock_ttl_secs: Option<u64>,
    },
    /// Tokens trickle in at `replenishment_rate` per second, clamped to `capacity`.
    ///
    /// A request that would have to wait at most `max_wait_secs` for its tokens is granted
    /// ahead of time; the caller must wait the returned `time_to_wait` before acting.
    Continuous { capacity: u64, replenishment_rate: f64, max_wait_secs: u64 },
}

impl Policy {
    /// Fixed-window policy without a lock.
    pub fn fixed_window(capacity: u64, window_secs: u64) -> Result<Self, PolicyError> {
        let policy = Policy::FixedWindow { capacity, window_secs, lock_ttl_secs: None };
        policy.validate()?;
        Ok(policy)
    }

    /// Continuous-replenishment policy with bounded wait.
    pub fn continuous(
        capacity: u64,
        replenishment_rate: f64,
        max_wait_secs: u64,
    ) -> Result<Self, PolicyError> {
        let policy = Policy::Continuous { capacity, replenishment_rate, max_wait_secs };
        policy.validate()?;
        Ok(policy)
    }

    /// Take the bucket's lock on every grant.
    ///
    /// Only fixed-window policies support the lock; a continuous policy is rejected with
    /// [`PolicyError::LockUnsupported`].
    pub fn with_lock(self, ttl_secs: u64) -> Result<Self, PolicyError> {
        match self {
            Policy::FixedWindow { capacity, window_secs, .. } => {
                let policy =
                    Policy::FixedWindow { capacity, window_secs, lock_ttl_secs: Some(ttl_secs) };
                policy.validate()?;
                Ok(policy)
            }
            Policy::Continuous { .. } => Err(PolicyError::LockUnsupported),
        }
    }

    /// Validate the numeric parameters.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let capacity = self.capacity();
        if capacity == 0 || i64::try_from(capacity).is_err() {
            return Err(PolicyError::InvalidCapacity { provided: capacity });
        }
        match *self {
            Policy::FixedWindow { window_secs, lock_ttl_secs, .. } => {
                if window_secs == 0 {
                    return Err(PolicyError::InvalidWindow { provided: window_secs });
                }
                if lock_ttl_secs == Some(0) {
                    return Err(PolicyError::InvalidLockTtl { provided: 0 });
                }
            }
            Policy::Continuous { replenishment_rate, .. } => {
                if !replenishment_rate.is_finite() || replenishment_rate <= 0.0 {
                    return Err(PolicyError::InvalidRate { provided: replenishment_rate });
                }
            }
        }
        Ok(())
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> u64 {
        match *self {
            Policy::FixedWindow { capacity, .. } | Policy::Continuous { capacity, .. } => capacity,
        }
    }

    /// Whether grants take the bucket's lock.
    pub fn uses_lock(&self) -> bool {
        matches!(self, Policy::FixedWindow { lock_ttl_secs: Some(_), .. })
    }
}

/// A caller's ask: how many tokens to consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    tokens: u64,
}

impl Request {
    /// Ask for `tokens` tokens; must be >= 1.
    pub fn new(tokens: u64) -> Result<Self, PolicyError> {
        if tokens == 0 || i64::try_from(tokens).is_err() {
            return Err(PolicyError::InvalidTokens { provided: tokens });
        }
        Ok(Self { tokens })
    }

    /// Ask for a single token.
    pub fn one() -> Self {
        Self { tokens: 1 }
    }

    pub fn tokens(&self) -> u64 {
        self.tokens
    }
}

/// Store keys derived from one resource key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKeys {
    /// Token count, the resource key verbatim.
    pub bucket: String,
    /// Continuous policy's replenishment timestamp.
    pub last_replenished: String,
    /// Mutual-exclusion lock.
    pub lock: String,
}

impl BucketKeys {
    /// Derive the companion keys, rejecting empty or non-printable resource keys.
    pub fn new(resource: impl Into<String>) -> Result<Self, PolicyError> {
        let bucket: String = resource.into();
        if bucket.trim().is_empty() {
            return Err(PolicyError::InvalidKey { reason: "key cannot be empty" });
        }
        if bucket.chars().any(|c| c.is_control()) {
            return Err(PolicyError::InvalidKey { reason: "key cannot contain control characters" });
        }
        Ok(Self {
            last_replenished: format!("{bucket}{LAST_REPLENISHED_SUFFIX}"),
            lock: format!("{bucket}{LOCK_SUFFIX}"),
            bucket,
        })
    }
}

/// Live-updatable policy handle.
///
/// Reads are lock-free snapshots; clones share the same policy so a retune is seen by every
/// handle on the next decision.
#[derive(Debug, Clone)]
pub struct LivePolicy {
    inner: Arc<ArcSwap<Policy>>,
}

impl LivePolicy {
    pub fn new(policy: Policy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self { inner: Arc::new(ArcSwap::from_pointee(policy)) })
    }

    /// Snapshot the current policy.
    pub fn get(&self) -> Arc<Policy> {
        self.inner.load_full()
    }

    /// Replace the policy after validating it. The old policy stays on error.
    pub fn set(&self, policy: Policy) -> Result<(), PolicyError> {
        policy.validate()?;
        self.inner.store(Arc::new(policy));
        Ok(())
    }
}
