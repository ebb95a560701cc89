//! Atomic execution substrate contract.
//!
//! A substrate registers named scripts and runs them against a list of keys and scalar
//! arguments as one indivisible step, returning a short tuple of integers. Tollgate does not
//! care how atomicity is achieved: [`InMemorySubstrate`] holds a mutex around the keyspace,
//! `tollgate-redis` relies on Redis running Lua scripts without interleaving.
//!
//! Argument layouts (keys; args) shared by every substrate:
//!
//! - [`Script::FixedWindow`]: `[bucket]`; `[capacity, window_secs, requested]`
//! - [`Script::FixedWindowLocked`]: `[bucket, lock]`;
//!   `[capacity, window_secs, requested, lock_ttl_secs]`
//! - [`Script::Continuous`]: `[bucket, last_replenished]`;
//!   `[capacity, rate, now, max_wait_secs, requested]`
//! - [`Script::TryLock`]: `[lock]`; `[ttl_secs]`
//! - [`Script::ReleaseLock`]: `[lock]`; `[]`

use async_trait::async_trait;
use std::fmt;

pub mod memory;
pub use memory::InMemorySubstrate;

/// The scripts a substrate must be able to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Script {
    FixedWindow,
    FixedWindowLocked,
    Continuous,
    TryLock,
    ReleaseLock,
}

impl Script {
    /// Every script, in registration order.
    pub const ALL: [Script; 5] = [
        Script::FixedWindow,
        Script::FixedWindowLocked,
        Script::Continuous,
        Script::TryLock,
        Script::ReleaseLock,
    ];

    /// Stable name, used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            Script::FixedWindow => "fixed_window",
            Script::FixedWindowLocked => "fixed_window_locked",
            Script::Continuous => "continuous",
            Script::TryLock => "try_lock",
            Script::ReleaseLock => "release_lock",
        }
    }

    /// Number of integers in a well-formed reply.
    pub fn reply_arity(self) -> usize {
        match self {
            Script::FixedWindow | Script::FixedWindowLocked => 2,
            Script::Continuous => 3,
            Script::TryLock | Script::ReleaseLock => 1,
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle a substrate returns when a script is registered (a SHA1 digest for Redis).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptId(String);

impl ScriptId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scalar script argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptArg {
    Int(i64),
    Float(f64),
}

impl ScriptArg {
    pub fn as_i64(self) -> Option<i64> {
        match self {
            ScriptArg::Int(v) => Some(v),
            ScriptArg::Float(_) => None,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            ScriptArg::Int(v) => v as f64,
            ScriptArg::Float(v) => v,
        }
    }
}

impl From<i64> for ScriptArg {
    fn from(v: i64) -> Self {
        ScriptArg::Int(v)
    }
}

impl From<f64> for ScriptArg {
    fn from(v: f64) -> Self {
        ScriptArg::Float(v)
    }
}

impl fmt::Display for ScriptArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptArg::Int(v) => write!(f, "{v}"),
            ScriptArg::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Failures at the substrate boundary.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubstrateError {
    /// The script could not be registered.
    #[error("registering `{script}` failed: {reason}")]
    Registration { script: &'static str, reason: String },
    /// The id is not (or no longer) registered, e.g. after a script cache flush.
    #[error("no script registered under {id}")]
    UnknownScript { id: ScriptId },
    /// The store could not be reached.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
    /// The script ran and failed.
    #[error("script execution failed: {reason}")]
    Execution { reason: String },
    /// The reply contained something other than integers.
    #[error("malformed reply from `{script}`: {reason}")]
    Malformed { script: &'static str, reason: String },
}

/// Atomic execution substrate.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Register `script`, returning the id to evaluate it by.
    async fn load(&self, script: Script) -> Result<ScriptId, SubstrateError>;

    /// Run a registered script atomically and return its positional reply.
    async fn eval(
        &self,
        id: &ScriptId,
        keys: &[&str],
        args: &[ScriptArg],
    ) -> Result<Vec<i64>, SubstrateError>;
}

#[async_trait]
impl<S: Substrate + ?Sized> Substrate for std::sync::Arc<S> {
    async fn load(&self, script: Script) -> Result<ScriptId, SubstrateError> {
        (**self).load(script).await
    }

    async fn eval(
        &self,
        id: &ScriptId,
        keys: &[&str],
        args: &[ScriptArg],
    ) -> Result<Vec<i64>, SubstrateError> {
        (**self).eval(id, keys, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = Script::ALL.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Script::ALL.len());
    }

    #[test]
    fn args_convert() {
        assert_eq!(ScriptArg::from(3i64).as_i64(), Some(3));
        assert_eq!(ScriptArg::from(0.5f64).as_i64(), None);
        assert_eq!(ScriptArg::Int(2).as_f64(), 2.0);
        assert_eq!(ScriptArg::Float(0.33).to_string(), "0.33");
    }
}
