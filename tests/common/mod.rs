#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate::{
    InMemorySubstrate, ManualClock, Policy, Script, ScriptArg, ScriptId, Sleeper, Substrate,
    SubstrateError, TokenBucket,
};

/// Sleeper that moves a manual clock forward instead of waiting.
#[derive(Debug, Clone)]
pub struct ClockSleeper {
    clock: ManualClock,
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl ClockSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, slept: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn total(&self) -> Duration {
        self.slept.lock().unwrap().iter().sum()
    }
}

impl Sleeper for ClockSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.clock.advance(duration);
        self.slept.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

/// Substrate whose store cannot be reached.
#[derive(Debug, Clone, Copy)]
pub struct DownSubstrate;

#[async_trait]
impl Substrate for DownSubstrate {
    async fn load(&self, _script: Script) -> Result<ScriptId, SubstrateError> {
        Err(SubstrateError::Unavailable { reason: "connection refused".into() })
    }

    async fn eval(
        &self,
        _id: &ScriptId,
        _keys: &[&str],
        _args: &[ScriptArg],
    ) -> Result<Vec<i64>, SubstrateError> {
        Err(SubstrateError::Unavailable { reason: "connection refused".into() })
    }
}

/// Bucket whose substrate expiry and caller clock both follow `clock`.
pub fn manual_bucket(
    clock: &ManualClock,
    key: &str,
    policy: Policy,
) -> (InMemorySubstrate, TokenBucket<InMemorySubstrate>) {
    let substrate = InMemorySubstrate::with_clock(clock.clone());
    let bucket = TokenBucket::new(substrate.clone(), key, policy)
        .unwrap()
        .with_clock(clock.clone())
        .with_sleeper(ClockSleeper::new(clock.clone()));
    (substrate, bucket)
}
