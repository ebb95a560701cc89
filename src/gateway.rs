//! Execution gateway: registers the admission scripts with a substrate, evaluates them and
//! turns positional replies into [`Decision`]s.
//!
//! Script ids are cached after the first registration. If the substrate reports an id as
//! unknown (its script cache was flushed), the gateway registers the script again and
//! repeats the evaluation once. That is a registration concern: a decision that was actually
//! made is never retried.

use crate::engine::{ContinuousReply, FixedWindowReply, LockedReply, ReplyError};
use crate::error::AdmissionError;
use crate::policy::{BucketKeys, Policy, Request};
use crate::rate_limit::Decision;
use crate::substrate::{Script, ScriptArg, ScriptId, Substrate, SubstrateError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Typed front door to a [`Substrate`].
#[derive(Debug)]
pub struct AdmissionGateway<S> {
    substrate: S,
    ids: Mutex<HashMap<Script, ScriptId>>,
}

fn int(value: u64) -> ScriptArg {
    ScriptArg::Int(i64::try_from(value).unwrap_or(i64::MAX))
}

fn secs(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}

fn violation(script: Script, err: ReplyError) -> AdmissionError {
    warn!(script = %script, reason = %err, "admission reply violates contract");
    AdmissionError::ContractViolation { script: script.name(), reason: err.0 }
}

impl<S: Substrate> AdmissionGateway<S> {
    pub fn new(substrate: S) -> Self {
        Self { substrate, ids: Mutex::new(HashMap::new()) }
    }

    /// Borrow the underlying substrate.
    pub fn substrate(&self) -> &S {
        &self.substrate
    }

    /// Register every script up front so the first decision does not pay for it.
    pub async fn preload(&self) -> Result<(), AdmissionError> {
        for script in Script::ALL {
            self.script_id(script).await?;
        }
        Ok(())
    }

    fn cached(&self, script: Script) -> Option<ScriptId> {
        self.ids.lock().ok()?.get(&script).cloned()
    }

    fn remember(&self, script: Script, id: ScriptId) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.insert(script, id);
        }
    }

    fn forget(&self, script: Script) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(&script);
        }
    }

    async fn script_id(&self, script: Script) -> Result<ScriptId, AdmissionError> {
        if let Some(id) = self.cached(script) {
            return Ok(id);
        }
        let id = self.substrate.load(script).await.map_err(|e| match e {
            SubstrateError::Unavailable { reason } => AdmissionError::Unavailable { reason },
            other => {
                AdmissionError::Registration { script: script.name(), reason: other.to_string() }
            }
        })?;
        debug!(script = %script, id = %id, "registered admission script");
        self.remember(script, id.clone());
        Ok(id)
    }

    async fn run(
        &self,
        script: Script,
        keys: &[&str],
        args: &[ScriptArg],
    ) -> Result<Vec<i64>, AdmissionError> {
        let id = self.script_id(script).await?;
        let result = match self.substrate.eval(&id, keys, args).await {
            Err(SubstrateError::UnknownScript { .. }) => {
                debug!(script = %script, id = %id, "script no longer registered, reloading");
                self.forget(script);
                let id = self.script_id(script).await?;
                self.substrate.eval(&id, keys, args).await
            }
            other => other,
        };
        result.map_err(|e| match e {
            SubstrateError::UnknownScript { id } => AdmissionError::Registration {
                script: script.name(),
                reason: format!("{id} vanished right after registration"),
            },
            other => other.into(),
        })
    }

    /// Decide one request for `keys` under `policy`.
    ///
    /// `now_secs` is only read by the continuous policy; it is the caller's clock, passed
    /// into the atomic step so every store sees the same timestamp.
    pub async fn admit(
        &self,
        keys: &BucketKeys,
        policy: &Policy,
        request: Request,
        now_secs: i64,
    ) -> Result<Decision, AdmissionError> {
        policy.validate()?;
        let tokens = int(request.tokens());

        let decision = match *policy {
            Policy::FixedWindow { capacity, window_secs, lock_ttl_secs: None } => {
                let script = Script::FixedWindow;
                let raw = self
                    .run(script, &[&keys.bucket], &[int(capacity), int(window_secs), tokens])
                    .await?;
                let reply = FixedWindowReply::decode(&raw).map_err(|e| violation(script, e))?;
                fixed_window_decision(reply)
            }
            Policy::FixedWindow { capacity, window_secs, lock_ttl_secs: Some(lock_ttl) } => {
                let script = Script::FixedWindowLocked;
                let raw = self
                    .run(
                        script,
                        &[&keys.bucket, &keys.lock],
                        &[int(capacity), int(window_secs), tokens, int(lock_ttl)],
                    )
                    .await?;
                match LockedReply::decode(&raw).map_err(|e| violation(script, e))? {
                    LockedReply::Locked => Decision::Locked,
                    LockedReply::Decided(reply) => fixed_window_decision(reply),
                }
            }
            Policy::Continuous { capacity, replenishment_rate, max_wait_secs } => {
                let script = Script::Continuous;
                let raw = self
                    .run(
                        script,
                        &[&keys.bucket, &keys.last_replenished],
                        &[
                            int(capacity),
                            ScriptArg::Float(replenishment_rate),
                            ScriptArg::Int(now_secs),
                            int(max_wait_secs),
                            tokens,
                        ],
                    )
                    .await?;
                match ContinuousReply::decode(&raw).map_err(|e| violation(script, e))? {
                    ContinuousReply::Decided { allowed: true, time_to_wait, tokens } => {
                        Decision::Allowed { remaining: tokens, wait: secs(time_to_wait) }
                    }
                    ContinuousReply::Decided { allowed: false, time_to_wait, tokens } => {
                        Decision::Denied { remaining: tokens, wait: secs(time_to_wait) }
                    }
                    ContinuousReply::ClockSkew { elapsed, tokens } => {
                        warn!(
                            key = %keys.bucket,
                            elapsed_secs = elapsed,
                            tokens,
                            "last replenishment is in the future, refusing to decide"
                        );
                        return Err(AdmissionError::ClockSkew {
                            key: keys.bucket.clone(),
                            elapsed_secs: elapsed,
                        });
                    }
                }
            }
        };

        debug!(
            key = %keys.bucket,
            tokens = request.tokens(),
            decision = ?decision,
            "admission decided"
        );
        Ok(decision)
    }

    /// Set `lock_key` with a TTL if it is absent.
    pub async fn try_lock(&self, lock_key: &str, ttl_secs: u64) -> Result<bool, AdmissionError> {
        let script = Script::TryLock;
        let raw = self.run(script, &[lock_key], &[int(ttl_secs)]).await?;
        crate::engine::decode_lock_reply(&raw).map_err(|e| violation(script, e))
    }

    /// Delete `lock_key` whoever holds it. Returns whether it existed.
    pub async fn release_lock(&self, lock_key: &str) -> Result<bool, AdmissionError> {
        let script = Script::ReleaseLock;
        let raw = self.run(script, &[lock_key], &[]).await?;
        crate::engine::decode_lock_reply(&raw).map_err(|e| violation(script, e))
    }
}

fn fixed_window_decision(reply: FixedWindowReply) -> Decision {
    if reply.allowed {
        Decision::Allowed { remaining: reply.tokens_left, wait: Duration::ZERO }
    } else {
        Decision::Denied { remaining: reply.tokens_left, wait: Duration::ZERO }
    }
}
