//! Mutual exclusion on a bucket's lock key.
//!
//! The lock is a key with a safety TTL: whoever sets it first holds it until it releases it
//! or the TTL lapses. Release is unconditional, which keeps crash recovery simple at the cost
//! of letting any caller drop a lock it does not hold. Holders that may outlive the TTL should
//! not rely on the lock for correctness.

use crate::error::AdmissionError;
use crate::gateway::AdmissionGateway;
use crate::substrate::Substrate;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sets and clears lock keys through the gateway.
#[derive(Debug)]
pub struct LockCoordinator<S> {
    gateway: Arc<AdmissionGateway<S>>,
}

impl<S> Clone for LockCoordinator<S> {
    fn clone(&self) -> Self {
        Self { gateway: Arc::clone(&self.gateway) }
    }
}

impl<S: Substrate> LockCoordinator<S> {
    pub fn new(gateway: Arc<AdmissionGateway<S>>) -> Self {
        Self { gateway }
    }

    /// Take `lock_key` for `ttl` if nobody holds it.
    ///
    /// The TTL is truncated to whole seconds and never shorter than one second.
    pub async fn try_acquire(&self, lock_key: &str, ttl: Duration) -> Result<bool, AdmissionError> {
        let acquired = self.gateway.try_lock(lock_key, ttl.as_secs().max(1)).await?;
        debug!(lock = lock_key, acquired, "lock attempt");
        Ok(acquired)
    }

    /// Drop `lock_key`. Returns whether a lock was actually held.
    pub async fn release(&self, lock_key: &str) -> Result<bool, AdmissionError> {
        let released = self.gateway.release_lock(lock_key).await?;
        debug!(lock = lock_key, released, "lock release");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::substrate::InMemorySubstrate;

    #[tokio::test]
    async fn lock_is_exclusive_until_ttl() {
        let clock = ManualClock::new();
        let substrate = InMemorySubstrate::with_clock(clock.clone());
        let locks = LockCoordinator::new(Arc::new(AdmissionGateway::new(substrate)));

        assert!(locks.try_acquire("api:lock", Duration::from_secs(30)).await.unwrap());
        assert!(!locks.try_acquire("api:lock", Duration::from_secs(30)).await.unwrap());

        clock.advance(Duration::from_secs(30));
        assert!(locks.try_acquire("api:lock", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn sub_second_ttl_rounds_up_to_one() {
        let substrate = InMemorySubstrate::with_clock(ManualClock::new());
        let locks = LockCoordinator::new(Arc::new(AdmissionGateway::new(substrate.clone())));

        assert!(locks.try_acquire("api:lock", Duration::from_millis(10)).await.unwrap());
        assert_eq!(substrate.ttl_secs("api:lock"), Some(1));
    }

    #[tokio::test]
    async fn release_reports_whether_held() {
        let locks =
            LockCoordinator::new(Arc::new(AdmissionGateway::new(InMemorySubstrate::new())));
        assert!(!locks.release("api:lock").await.unwrap());

        locks.try_acquire("api:lock", Duration::from_secs(5)).await.unwrap();
        assert!(locks.release("api:lock").await.unwrap());
        assert!(locks.try_acquire("api:lock", Duration::from_secs(5)).await.unwrap());
    }
}
