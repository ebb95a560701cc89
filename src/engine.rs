//! Admission engine.
//!
//! The functions in [`fixed_window`] and [`continuous`] are the whole read-decide-mutate
//! sequence for one request. They are synchronous and deterministic: time is an argument,
//! and the only side effects go through a [`Keyspace`]. A substrate makes them atomic by
//! running them while nothing else can touch the keyspace (a mutex for
//! [`InMemorySubstrate`](crate::substrate::InMemorySubstrate), a server-side script for Redis).
//!
//! Each function returns a typed reply that encodes to the fixed-shape integer tuple the
//! substrate contract hands back to the gateway:
//!
//! | script                | reply                                   |
//! |-----------------------|-----------------------------------------|
//! | fixed window          | `(allowed, tokens_left)`                |
//! | fixed window + lock   | `(allowed, tokens_left)` or `(-1, -1)`  |
//! | continuous            | `(allowed, time_to_wait, tokens)` or `(-2, elapsed, tokens)` |
//! | try lock / release    | `(acquired)` / `(deleted)`              |

pub mod continuous;
pub mod fixed_window;

pub use continuous::{continuous, ContinuousArgs, ContinuousReply};
pub use fixed_window::{fixed_window, fixed_window_locked, FixedWindowReply, LockedReply};

/// First slot of a fixed-window+lock reply when the lock is held.
pub const LOCKED_FLAG: i64 = -1;

/// First slot of a continuous reply when the stored timestamp is ahead of `now`.
pub const CLOCK_SKEW_FLAG: i64 = -2;

/// Integer key-value operations the engine needs, with Redis semantics.
pub trait Keyspace {
    /// Current value, or `None` if absent or expired.
    fn get(&mut self, key: &str) -> Option<i64>;

    /// Store without expiry, clearing any existing TTL.
    fn set(&mut self, key: &str, value: i64);

    /// Store with a TTL in seconds.
    fn set_ex(&mut self, key: &str, value: i64, ttl_secs: u64);

    /// Store with a TTL only if the key is absent. Returns whether it was stored.
    fn set_nx_ex(&mut self, key: &str, value: i64, ttl_secs: u64) -> bool;

    /// Subtract `by`, keeping any TTL. A missing key counts as zero.
    fn decr_by(&mut self, key: &str, by: i64) -> i64;

    /// Remove the key. Returns whether it existed.
    fn delete(&mut self, key: &str) -> bool;

    fn exists(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// A positional reply that does not fit the script's contract.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ReplyError(pub String);

pub(crate) fn expect_arity(raw: &[i64], arity: usize) -> Result<(), ReplyError> {
    if raw.len() != arity {
        return Err(ReplyError(format!("expected {arity} elements, got {}", raw.len())));
    }
    Ok(())
}

pub(crate) fn decode_flag(value: i64, slot: &str) -> Result<bool, ReplyError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ReplyError(format!("unexpected {slot} flag {other}"))),
    }
}

/// Reply of the standalone lock scripts: whether the lock was acquired or deleted.
pub fn decode_lock_reply(raw: &[i64]) -> Result<bool, ReplyError> {
    expect_arity(raw, 1)?;
    decode_flag(raw[0], "lock")
}

/// Set-if-absent with TTL.
pub fn try_lock<K: Keyspace + ?Sized>(ks: &mut K, lock_key: &str, ttl_secs: u64) -> bool {
    ks.set_nx_ex(lock_key, 1, ttl_secs)
}

/// Unconditional delete; no ownership check.
pub fn release_lock<K: Keyspace + ?Sized>(ks: &mut K, lock_key: &str) -> bool {
    ks.delete(lock_key)
}


#[cfg(test)]
mod tests {
    use super::testing::MapKeyspace;
    use super::*;

    #[test]
    fn try_lock_is_set_if_absent() {
        let mut ks = MapKeyspace::default();
        assert!(try_lock(&mut ks, "api:lock", 30));
        assert!(!try_lock(&mut ks, "api:lock", 30));
        assert_eq!(ks.ttls.get("api:lock"), Some(&30));
    }

    #[test]
    fn release_is_unconditional() {
        let mut ks = MapKeyspace::default();
        assert!(!release_lock(&mut ks, "api:lock"));
        try_lock(&mut ks, "api:lock", 30);
        assert!(release_lock(&mut ks, "api:lock"));
        assert!(try_lock(&mut ks, "api:lock", 30));
    }

    #[test]
    fn lock_reply_decodes_single_flag() {
        assert_eq!(decode_lock_reply(&[1]), Ok(true));
        assert_eq!(decode_lock_reply(&[0]), Ok(false));
        assert!(decode_lock_reply(&[]).is_err());
        assert!(decode_lock_reply(&[2]).is_err());
    }
}
