//! Fixed-window policy: the bucket refills to capacity only when its TTL lapses.

use super::{decode_flag, expect_arity, Keyspace, ReplyError, LOCKED_FLAG};

/// Outcome of one fixed-window decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowReply {
    pub allowed: bool,
    /// Post-decrement count if allowed, unchanged count otherwise.
    pub tokens_left: i64,
}

impl FixedWindowReply {
    pub fn encode(&self) -> Vec<i64> {
        vec![i64::from(self.allowed), self.tokens_left]
    }

    pub fn decode(raw: &[i64]) -> Result<Self, ReplyError> {
        expect_arity(raw, 2)?;
        Ok(Self { allowed: decode_flag(raw[0], "allowed")?, tokens_left: raw[1] })
    }
}

/// Outcome of a fixed-window decision guarded by the bucket's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockedReply {
    /// Another caller holds the lock; nothing was read or written.
    Locked,
    /// The lock was free and the bucket decided.
    Decided(FixedWindowReply),
}

impl LockedReply {
    pub fn encode(&self) -> Vec<i64> {
        match self {
            LockedReply::Locked => vec![LOCKED_FLAG, -1],
            LockedReply::Decided(reply) => reply.encode(),
        }
    }

    pub fn decode(raw: &[i64]) -> Result<Self, ReplyError> {
        expect_arity(raw, 2)?;
        if raw[0] == LOCKED_FLAG {
            return Ok(LockedReply::Locked);
        }
        FixedWindowReply::decode(raw).map(LockedReply::Decided)
    }
}

/// Decide one request against a fixed-window bucket.
///
/// A missing (never created or expired) bucket is created full with a TTL of `window_secs`.
/// Requests larger than `capacity` are never granted.
pub fn fixed_window<K: Keyspace + ?Sized>(
    ks: &mut K,
    bucket: &str,
    capacity: i64,
    window_secs: u64,
    requested: i64,
) -> FixedWindowReply {
    let tokens = match ks.get(bucket) {
        Some(tokens) => tokens,
        None => {
            ks.set_ex(bucket, capacity, window_secs);
            capacity
        }
    };

    if tokens >= requested {
        let tokens_left = ks.decr_by(bucket, requested);
        FixedWindowReply { allowed: true, tokens_left }
    } else {
        FixedWindowReply { allowed: false, tokens_left: tokens }
    }
}

/// Decide one request, taking the bucket's lock on a grant.
///
/// A held lock short-circuits before the bucket is touched. A free lock is set with
/// `lock_ttl_secs`; if the bucket then denies, the lock is dropped again in the same step so
/// it is only ever left held by a caller that was granted.
pub fn fixed_window_locked<K: Keyspace + ?Sized>(
    ks: &mut K,
    bucket: &str,
    lock: &str,
    capacity: i64,
    window_secs: u64,
    requested: i64,
    lock_ttl_secs: u64,
) -> LockedReply {
    if !ks.set_nx_ex(lock, 1, lock_ttl_secs) {
        return LockedReply::Locked;
    }

    let reply = fixed_window(ks, bucket, capacity, window_secs, requested);
    if !reply.allowed {
        ks.delete(lock);
    }
    LockedReply::Decided(reply)
}
