//! Handle on one shared token bucket.
//!
//! ```rust
//! use tollgate::{Policy, TokenBucket, InMemorySubstrate};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = Policy::fixed_window(10, 30)?;
//! let bucket = TokenBucket::new(InMemorySubstrate::new(), "token_bucket", policy)?;
//! let decision = bucket.acquire(2).await?;
//! assert_eq!(decision.remaining(), Some(8));
//! # Ok(())
//! # }
//! ```

use super::{Decision, RateLimiter};
use crate::clock::{Clock, SystemClock};
use crate::error::AdmissionError;
use crate::gateway::AdmissionGateway;
use crate::lock::LockCoordinator;
use crate::policy::{BucketKeys, LivePolicy, Policy, PolicyError, Request};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::substrate::Substrate;
use crate::telemetry::{emit_best_effort, AdmissionEvent, NullSink, TelemetrySink};
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default pause between attempts when the bucket gives no better hint.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default cap on a single backoff pause.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Shortest backoff pause, whatever the interval and cap are set to.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// One resource key, one live policy, one gateway. Clones share all three.
pub struct TokenBucket<S, T = NullSink> {
    gateway: Arc<AdmissionGateway<S>>,
    locks: LockCoordinator<S>,
    keys: BucketKeys,
    policy: LivePolicy,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: T,
    retry_interval: Duration,
    max_backoff: Duration,
}

impl<S, T: Clone> Clone for TokenBucket<S, T> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            locks: self.locks.clone(),
            keys: self.keys.clone(),
            policy: self.policy.clone(),
            clock: Arc::clone(&self.clock),
            sleeper: Arc::clone(&self.sleeper),
            sink: self.sink.clone(),
            retry_interval: self.retry_interval,
            max_backoff: self.max_backoff,
        }
    }
}

impl<S, T> fmt::Debug for TokenBucket<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("keys", &self.keys)
            .field("policy", &self.policy.get())
            .field("retry_interval", &self.retry_interval)
            .field("max_backoff", &self.max_backoff)
            .finish()
    }
}

impl<S: Substrate> TokenBucket<S, NullSink> {
    /// Bucket on its own gateway over `substrate`.
    pub fn new(substrate: S, key: impl Into<String>, policy: Policy) -> Result<Self, PolicyError> {
        Self::shared(Arc::new(AdmissionGateway::new(substrate)), key, policy)
    }

    /// Bucket on a gateway shared with other buckets, so scripts are registered once.
    pub fn shared(
        gateway: Arc<AdmissionGateway<S>>,
        key: impl Into<String>,
        policy: Policy,
    ) -> Result<Self, PolicyError> {
        Ok(Self {
            locks: LockCoordinator::new(Arc::clone(&gateway)),
            gateway,
            keys: BucketKeys::new(key)?,
            policy: LivePolicy::new(policy)?,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            sink: NullSink,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_backoff: DEFAULT_MAX_BACKOFF,
        })
    }
}

impl<S, T> TokenBucket<S, T> {
    /// Clock whose seconds are passed to the continuous policy.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sleeper<Z: Sleeper + 'static>(mut self, sleeper: Z) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Report decisions to `sink`.
    pub fn with_sink<U>(self, sink: U) -> TokenBucket<S, U> {
        TokenBucket {
            gateway: self.gateway,
            locks: self.locks,
            keys: self.keys,
            policy: self.policy,
            clock: self.clock,
            sleeper: self.sleeper,
            sink,
            retry_interval: self.retry_interval,
            max_backoff: self.max_backoff,
        }
    }

    /// Share a live policy with other handles; a retune through any of them applies to all.
    pub fn with_live_policy(mut self, policy: LivePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Pause between attempts in [`acquire_within`](Self::acquire_within) when the bucket
    /// gives no better hint. Pauses never drop below [`MIN_BACKOFF`].
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn keys(&self) -> &BucketKeys {
        &self.keys
    }

    /// Snapshot of the current policy.
    pub fn policy(&self) -> Arc<Policy> {
        self.policy.get()
    }

    /// Handle to the live policy, for sharing with other buckets.
    pub fn live_policy(&self) -> &LivePolicy {
        &self.policy
    }

    /// Retune the bucket. Stored state is kept; the next decision uses the new parameters.
    pub fn set_policy(&self, policy: Policy) -> Result<(), PolicyError> {
        self.policy.set(policy)
    }

    pub fn gateway(&self) -> &Arc<AdmissionGateway<S>> {
        &self.gateway
    }
}

impl<S, T> TokenBucket<S, T>
where
    S: Substrate,
    T: TelemetrySink + Sync,
    <T as tower::Service<AdmissionEvent>>::Future: Send + 'static,
{
    async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn decide(&self, tokens: u64, policy: &Policy) -> Result<Decision, AdmissionError> {
        let result = match Request::new(tokens) {
            Ok(request) => {
                self.gateway.admit(&self.keys, policy, request, self.clock.now_secs()).await
            }
            Err(e) => Err(e.into()),
        };
        let key = self.keys.bucket.clone();
        let event = match &result {
            Ok(Decision::Allowed { remaining, wait }) => {
                AdmissionEvent::Granted { key, tokens, remaining: *remaining, wait: *wait }
            }
            Ok(Decision::Denied { remaining, wait }) => {
                AdmissionEvent::Denied { key, tokens, remaining: *remaining, wait: *wait }
            }
            Ok(Decision::Locked) => AdmissionEvent::Locked { key },
            Err(e) => AdmissionEvent::Failed { key, reason: e.to_string() },
        };
        self.emit(event).await;
        result
    }

    /// Ask for `tokens` once, without waiting.
    ///
    /// A continuous grant may carry a non-zero `wait`: the tokens are already consumed and the
    /// caller must not act before the wait has passed. Use
    /// [`acquire_and_wait`](Self::acquire_and_wait) to have that done for you.
    pub async fn acquire(&self, tokens: u64) -> Result<Decision, AdmissionError> {
        let policy = self.policy.get();
        self.decide(tokens, &policy).await
    }

    /// Like [`acquire`](Self::acquire), but sleeps out a granted `wait` before returning.
    pub async fn acquire_and_wait(&self, tokens: u64) -> Result<Decision, AdmissionError> {
        let decision = self.acquire(tokens).await?;
        if let Decision::Allowed { wait, .. } = decision {
            if !wait.is_zero() {
                debug!(key = %self.keys.bucket, ?wait, "waiting out replenishment");
                self.sleeper.sleep(wait).await;
            }
        }
        Ok(decision)
    }

    /// Keep asking until granted or until the next pause would overrun `timeout`.
    ///
    /// Pauses use equal jitter around a base that is the time a denied continuous request
    /// still has to shed to fit under its wait bound, or the retry interval otherwise.
    /// Returns the last decision, which is a denial or `Locked` if time ran out.
    pub async fn acquire_within(
        &self,
        tokens: u64,
        timeout: Duration,
    ) -> Result<Decision, AdmissionError> {
        let mut waited = Duration::ZERO;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let policy = self.policy.get();
            let decision = self.decide(tokens, &policy).await?;
            if let Decision::Allowed { wait, .. } = decision {
                if !wait.is_zero() {
                    self.sleeper.sleep(wait).await;
                }
                return Ok(decision);
            }

            let pause = self.backoff(&decision, &policy);
            if waited + pause > timeout {
                debug!(key = %self.keys.bucket, attempts, ?waited, "gave up acquiring");
                return Ok(decision);
            }
            self.sleeper.sleep(pause).await;
            waited += pause;
        }
    }

    fn backoff(&self, decision: &Decision, policy: &Policy) -> Duration {
        let hint = match (decision, policy) {
            (Decision::Denied { wait, .. }, Policy::Continuous { max_wait_secs, .. }) => {
                wait.saturating_sub(Duration::from_secs(*max_wait_secs))
            }
            _ => Duration::ZERO,
        };
        let base = hint.max(self.retry_interval).min(self.max_backoff).max(MIN_BACKOFF);
        equal_jitter(base)
    }

    /// Drop the bucket's lock, whoever holds it.
    pub async fn release_lock(&self) -> Result<(), AdmissionError> {
        self.locks.release(&self.keys.lock).await?;
        self.emit(AdmissionEvent::LockReleased { key: self.keys.bucket.clone() }).await;
        Ok(())
    }

    /// Acquire, run `f`, and release the lock if the policy took one.
    ///
    /// Returns `Ok(Err(decision))` without running `f` if the request was denied or locked.
    /// A failed release is logged and reported to the sink; the lock then lapses with its
    /// TTL and the value of `f` is still returned.
    pub async fn run_exclusive<F, Fut, R>(
        &self,
        tokens: u64,
        f: F,
    ) -> Result<Result<R, Decision>, AdmissionError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
        R: Send,
    {
        let policy = self.policy.get();
        let decision = self.decide(tokens, &policy).await?;
        let Decision::Allowed { wait, .. } = decision else {
            return Ok(Err(decision));
        };
        if !wait.is_zero() {
            self.sleeper.sleep(wait).await;
        }

        let value = f().await;

        if policy.uses_lock() {
            if let Err(e) = self.release_lock().await {
                warn!(
                    key = %self.keys.bucket,
                    error = %e,
                    "failed to release lock, leaving it to expire"
                );
                let key = self.keys.bucket.clone();
                self.emit(AdmissionEvent::Failed { key, reason: e.to_string() }).await;
            }
        }
        Ok(Ok(value))
    }
}

fn equal_jitter(base: Duration) -> Duration {
    let millis = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    if millis < 2 {
        return base;
    }
    let half = millis / 2;
    Duration::from_millis(rand::rng().random_range(half..=millis))
}

#[async_trait::async_trait]
impl<S, T> RateLimiter for TokenBucket<S, T>
where
    S: Substrate,
    T: TelemetrySink + Sync,
    <T as tower::Service<AdmissionEvent>>::Future: Send + 'static,
{
    async fn acquire(&self, tokens: u64) -> Result<Decision, AdmissionError> {
        TokenBucket::acquire(self, tokens).await
    }
}
