//! Continuous policy: tokens accrue at a constant rate, and requests that would only have
//! to wait a bounded time for their tokens are granted ahead of time.
//!
//! A grant with `time_to_wait > 0` consumes tokens the bucket does not have yet, so the
//! stored count goes negative by at most `ceil(rate * max_wait)`. That debt is what stops the
//! next caller from being granted the same future tokens; replenishment pays it back before
//! the bucket shows anything available again.

use super::{decode_flag, expect_arity, Keyspace, ReplyError, CLOCK_SKEW_FLAG};

/// Parameters of one continuous decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContinuousArgs {
    pub capacity: i64,
    /// Tokens per second.
    pub rate: f64,
    /// Caller's clock, seconds since the epoch.
    pub now: i64,
    /// Longest `time_to_wait` that is still granted.
    pub max_wait: i64,
    pub requested: i64,
}

/// Outcome of one continuous decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuousReply {
    Decided {
        allowed: bool,
        /// Seconds until replenishment covers the request; zero if tokens were on hand.
        time_to_wait: i64,
        /// Post-consumption count if allowed, unchanged count otherwise.
        tokens: i64,
    },
    /// The stored replenishment timestamp is ahead of `now`. Nothing was written.
    ClockSkew { elapsed: i64, tokens: i64 },
}

impl ContinuousReply {
    pub fn encode(&self) -> Vec<i64> {
        match *self {
            ContinuousReply::Decided { allowed, time_to_wait, tokens } => {
                vec![i64::from(allowed), time_to_wait, tokens]
            }
            ContinuousReply::ClockSkew { elapsed, tokens } => {
                vec![CLOCK_SKEW_FLAG, elapsed, tokens]
            }
        }
    }

    pub fn decode(raw: &[i64]) -> Result<Self, ReplyError> {
        expect_arity(raw, 3)?;
        if raw[0] == CLOCK_SKEW_FLAG {
            if raw[1] >= 0 {
                return Err(ReplyError(format!("clock skew reported with elapsed {}", raw[1])));
            }
            return Ok(ContinuousReply::ClockSkew { elapsed: raw[1], tokens: raw[2] });
        }
        let allowed = decode_flag(raw[0], "allowed")?;
        if raw[1] < 0 {
            return Err(ReplyError(format!("negative time_to_wait {}", raw[1])));
        }
        Ok(ContinuousReply::Decided { allowed, time_to_wait: raw[1], tokens: raw[2] })
    }
}

/// Whole tokens accrued over `elapsed` seconds.
pub fn tokens_accrued(rate: f64, elapsed: i64) -> i64 {
    (rate * elapsed as f64).floor() as i64
}

/// Seconds of replenishment needed to cover a deficit of `deficit` tokens. Saturates at
/// `i64::MAX`.
pub fn wait_for_deficit(rate: f64, deficit: i64) -> i64 {
    if deficit <= 0 {
        return 0;
    }
    (deficit as f64 / rate).ceil() as i64
}

/// Decide one request against a continuously replenished bucket.
///
/// A missing bucket (either key absent) is created full, stamped at `now`. The stamp only
/// advances when tokens are actually added, so elapsed time is not lost while the bucket is
/// full. The request is granted when the projected wait is at most `max_wait`.
pub fn continuous<K: Keyspace + ?Sized>(
    ks: &mut K,
    bucket: &str,
    last_replenished: &str,
    args: ContinuousArgs,
) -> ContinuousReply {
    let (mut tokens, stamp) = match (ks.get(bucket), ks.get(last_replenished)) {
        (Some(tokens), Some(stamp)) => (tokens, stamp),
        _ => {
            ks.set(bucket, args.capacity);
            ks.set(last_replenished, args.now);
            (args.capacity, args.now)
        }
    };

    let elapsed = args.now.saturating_sub(stamp);
    if elapsed < 0 {
        return ContinuousReply::ClockSkew { elapsed, tokens };
    }

    let accrued = tokens_accrued(args.rate, elapsed);
    let room = args.capacity.saturating_sub(tokens);
    if accrued > 0 && room > 0 {
        tokens += accrued.min(room);
        ks.set(bucket, tokens);
        ks.set(last_replenished, args.now);
    }

    // Saturating: a bucket in debt facing a huge request must deny, not wrap.
    let after = tokens.saturating_sub(args.requested);
    let time_to_wait = wait_for_deficit(args.rate, after.saturating_neg());

    if time_to_wait > args.max_wait {
        return ContinuousReply::Decided { allowed: false, time_to_wait, tokens };
    }

    ks.set(bucket, after);
    ContinuousReply::Decided { allowed: true, time_to_wait, tokens: after }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MapKeyspace;

    const BUCKET: &str = "api";
    const STAMP: &str = "api:last_replenished";

    fn args(now: i64, max_wait: i64) -> ContinuousArgs {
        ContinuousArgs { capacity: 10, rate: 0.33, now, max_wait, requested: 1 }
    }

    fn decide(ks: &mut MapKeyspace, now: i64, max_wait: i64) -> ContinuousReply {
        continuous(ks, BUCKET, STAMP, args(now, max_wait))
    }

    #[test]
    fn fresh_bucket_grants_immediately() {
        let mut ks = MapKeyspace::default();
        let reply = decide(&mut ks, 0, 10);
        assert_eq!(reply, ContinuousReply::Decided { allowed: true, time_to_wait: 0, tokens: 9 });
        assert_eq!(ks.values[STAMP], 0);
    }

    #[test]
    fn empty_bucket_projects_ceiling_wait() {
        let mut ks = MapKeyspace::default();
        for _ in 0..10 {
            decide(&mut ks, 0, 10);
        }
        assert_eq!(ks.values[BUCKET], 0);

        // ceil(1 / 0.33) = 4
        let reply = decide(&mut ks, 0, 4);
        assert_eq!(reply, ContinuousReply::Decided { allowed: true, time_to_wait: 4, tokens: -1 });
    }

    #[test]
    fn wait_beyond_bound_is_denied_without_decrement() {
        let mut ks = MapKeyspace::default();
        for _ in 0..10 {
            decide(&mut ks, 0, 10);
        }
        let reply = decide(&mut ks, 0, 3);
        assert_eq!(reply, ContinuousReply::Decided { allowed: false, time_to_wait: 4, tokens: 0 });
        assert_eq!(ks.values[BUCKET], 0);
    }

    #[test]
    fn zero_max_wait_grants_only_tokens_on_hand() {
        let mut ks = MapKeyspace::default();
        for _ in 0..10 {
            let reply = decide(&mut ks, 0, 0);
            assert!(matches!(reply, ContinuousReply::Decided { allowed: true, .. }));
        }
        assert!(matches!(decide(&mut ks, 0, 0), ContinuousReply::Decided { allowed: false, .. }));
    }

    #[test]
    fn oversized_request_on_indebted_bucket_is_denied() {
        let mut ks = MapKeyspace::default();
        let base = ContinuousArgs { capacity: 10, rate: 1.0, now: 0, max_wait: 100, requested: 1 };
        for _ in 0..12 {
            continuous(&mut ks, BUCKET, STAMP, base);
        }
        assert_eq!(ks.values[BUCKET], -2);

        let huge = ContinuousArgs { requested: i64::MAX, ..base };
        let reply = continuous(&mut ks, BUCKET, STAMP, huge);
        assert_eq!(
            reply,
            ContinuousReply::Decided { allowed: false, time_to_wait: i64::MAX, tokens: -2 }
        );
        assert_eq!(ks.values[BUCKET], -2);

        let reply = continuous(&mut ks, BUCKET, STAMP, base);
        assert_eq!(reply, ContinuousReply::Decided { allowed: true, time_to_wait: 3, tokens: -3 });
    }

    #[test]
    fn wait_for_deficit_saturates() {
        assert_eq!(wait_for_deficit(0.5, i64::MAX), i64::MAX);
        assert_eq!(wait_for_deficit(2.0, 0), 0);
    }

    #[test]
    fn debt_pushes_later_waits_out() {
        let mut ks = MapKeyspace::default();
        for _ in 0..10 {
            decide(&mut ks, 0, 100);
        }
        let waits: Vec<_> = (0..3)
            .map(|_| match decide(&mut ks, 0, 100) {
                ContinuousReply::Decided { time_to_wait, .. } => time_to_wait,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        // deficits 1, 2, 3 at 0.33/s
        assert_eq!(waits, vec![4, 7, 10]);
    }

    #[test]
    fn replenishment_floors_and_advances_stamp() {
        let mut ks = MapKeyspace::default();
        for _ in 0..5 {
            decide(&mut ks, 0, 10);
        }
        // floor(0.33 * 7) = 2
        let reply = decide(&mut ks, 7, 10);
        assert_eq!(reply, ContinuousReply::Decided { allowed: true, time_to_wait: 0, tokens: 6 });
        assert_eq!(ks.values[STAMP], 7);
    }

    #[test]
    fn sub_token_elapsed_keeps_stamp() {
        let mut ks = MapKeyspace::default();
        decide(&mut ks, 0, 10);
        decide(&mut ks, 3, 10);
        assert_eq!(ks.values[STAMP], 0);
        assert_eq!(ks.values[BUCKET], 8);
    }

    #[test]
    fn replenishment_clamps_to_capacity() {
        let mut ks = MapKeyspace::default();
        for _ in 0..3 {
            decide(&mut ks, 0, 10);
        }
        let reply = decide(&mut ks, 1_000_000, 10);
        assert_eq!(reply, ContinuousReply::Decided { allowed: true, time_to_wait: 0, tokens: 9 });
        assert!(ks.values[BUCKET] <= 10);
    }

    #[test]
    fn full_bucket_does_not_advance_stamp() {
        let mut ks = MapKeyspace::default();
        ks.set(BUCKET, 10);
        ks.set(STAMP, 0);

        let mut args = args(100, 10);
        args.requested = 2;
        continuous(&mut ks, BUCKET, STAMP, args);
        assert_eq!(ks.values[STAMP], 0);
        assert_eq!(ks.values[BUCKET], 8);
    }

    #[test]
    fn backwards_clock_is_reported_not_replenished() {
        let mut ks = MapKeyspace::default();
        decide(&mut ks, 100, 10);

        let reply = decide(&mut ks, 95, 10);
        assert_eq!(reply, ContinuousReply::ClockSkew { elapsed: -5, tokens: 9 });
        assert_eq!(ks.values[BUCKET], 9);
        assert_eq!(ks.values[STAMP], 100);
    }

    #[test]
    fn half_initialized_bucket_is_reset() {
        let mut ks = MapKeyspace::default();
        ks.set(BUCKET, 3);

        let reply = decide(&mut ks, 50, 10);
        assert_eq!(reply, ContinuousReply::Decided { allowed: true, time_to_wait: 0, tokens: 9 });
        assert_eq!(ks.values[STAMP], 50);
    }

    #[test]
    fn decode_checks_shape_and_signs() {
        let skew = ContinuousReply::ClockSkew { elapsed: -3, tokens: 4 };
        assert_eq!(ContinuousReply::decode(&skew.encode()), Ok(skew));
        assert!(ContinuousReply::decode(&[-2, 3, 4]).is_err());
        assert!(ContinuousReply::decode(&[1, -1, 4]).is_err());
        assert!(ContinuousReply::decode(&[1, 0]).is_err());
        assert!(ContinuousReply::decode(&[-2, -1, 0, 0]).is_err());
    }

    #[test]
    fn wait_helpers() {
        assert_eq!(wait_for_deficit(0.33, 0), 0);
        assert_eq!(wait_for_deficit(0.33, -4), 0);
        assert_eq!(wait_for_deficit(2.0, 3), 2);
        assert_eq!(tokens_accrued(0.5, 3), 1);
    }
}
