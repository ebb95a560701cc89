//! In-process substrate: a mutex-guarded keyspace with per-key expiry.
//!
//! Every `eval` runs the engine function for its script while holding the keyspace mutex,
//! so per-key operations are linearizable across any number of tasks sharing the substrate
//! (clones share state). Expiry is evaluated lazily against the injected [`Clock`], once per
//! `eval`, so a script sees a single consistent "now".

use super::{Script, ScriptArg, ScriptId, Substrate, SubstrateError};
use crate::clock::{Clock, SystemClock};
use crate::engine::{self, ContinuousArgs, Keyspace};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |deadline| now_ms < deadline)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    scripts: HashMap<ScriptId, Script>,
    generation: u64,
}

/// In-memory substrate for tests, single-process deployments and benchmarks.
#[derive(Debug, Clone)]
pub struct InMemorySubstrate {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubstrate {
    /// Substrate driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Override the clock used for key expiry (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { state: Arc::new(Mutex::new(State::default())), clock: Arc::new(clock) }
    }

    /// Forget every registered script, as `SCRIPT FLUSH` would.
    pub fn flush_scripts(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.scripts.clear();
        }
    }

    /// Current value of a live key.
    pub fn peek(&self, key: &str) -> Option<i64> {
        let now_ms = self.clock.now_millis();
        let state = self.state.lock().ok()?;
        state.entries.get(key).filter(|e| e.is_live(now_ms)).map(|e| e.value)
    }

    /// Remaining TTL of a live key in whole seconds (rounded up); `None` if absent or persistent.
    pub fn ttl_secs(&self, key: &str) -> Option<u64> {
        let now_ms = self.clock.now_millis();
        let state = self.state.lock().ok()?;
        let entry = state.entries.get(key).filter(|e| e.is_live(now_ms))?;
        entry.expires_at_ms.map(|deadline| (deadline - now_ms + 999) / 1_000)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>, SubstrateError> {
        self.state
            .lock()
            .map_err(|_| SubstrateError::Unavailable { reason: "keyspace mutex poisoned".into() })
    }
}

struct MemoryKeyspace<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now_ms: u64,
}

impl MemoryKeyspace<'_> {
    fn deadline(&self, ttl_secs: u64) -> Option<u64> {
        Some(self.now_ms.saturating_add(ttl_secs.saturating_mul(1_000)))
    }
}

impl Keyspace for MemoryKeyspace<'_> {
    fn get(&mut self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(entry) if entry.is_live(self.now_ms) => Some(entry.value),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&mut self, key: &str, value: i64) {
        self.entries.insert(key.to_string(), Entry { value, expires_at_ms: None });
    }

    fn set_ex(&mut self, key: &str, value: i64, ttl_secs: u64) {
        let expires_at_ms = self.deadline(ttl_secs);
        self.entries.insert(key.to_string(), Entry { value, expires_at_ms });
    }

    fn set_nx_ex(&mut self, key: &str, value: i64, ttl_secs: u64) -> bool {
        if self.exists(key) {
            return false;
        }
        self.set_ex(key, value, ttl_secs);
        true
    }

    fn decr_by(&mut self, key: &str, by: i64) -> i64 {
        let expires_at_ms = match self.get(key) {
            Some(_) => self.entries.get(key).and_then(|e| e.expires_at_ms),
            None => None,
        };
        let entry =
            self.entries.entry(key.to_string()).or_insert(Entry { value: 0, expires_at_ms });
        entry.value = entry.value.saturating_sub(by);
        entry.value
    }

    fn delete(&mut self, key: &str) -> bool {
        let live = self.exists(key);
        self.entries.remove(key);
        live
    }
}

fn key<'k>(keys: &[&'k str], index: usize, script: Script) -> Result<&'k str, SubstrateError> {
    keys.get(index).copied().ok_or_else(|| SubstrateError::Execution {
        reason: format!("{script}: missing key #{}", index + 1),
    })
}

fn int_arg(args: &[ScriptArg], index: usize, script: Script) -> Result<i64, SubstrateError> {
    args.get(index).and_then(|a| a.as_i64()).ok_or_else(|| SubstrateError::Execution {
        reason: format!("{script}: argument #{} must be an integer", index + 1),
    })
}

fn secs_arg(args: &[ScriptArg], index: usize, script: Script) -> Result<u64, SubstrateError> {
    let value = int_arg(args, index, script)?;
    u64::try_from(value).map_err(|_| SubstrateError::Execution {
        reason: format!("{script}: argument #{} must be non-negative", index + 1),
    })
}

fn float_arg(args: &[ScriptArg], index: usize, script: Script) -> Result<f64, SubstrateError> {
    args.get(index).map(|a| a.as_f64()).ok_or_else(|| SubstrateError::Execution {
        reason: format!("{script}: missing argument #{}", index + 1),
    })
}

fn execute(
    ks: &mut MemoryKeyspace<'_>,
    script: Script,
    keys: &[&str],
    args: &[ScriptArg],
) -> Result<Vec<i64>, SubstrateError> {
    let reply = match script {
        Script::FixedWindow => engine::fixed_window(
            ks,
            key(keys, 0, script)?,
            int_arg(args, 0, script)?,
            secs_arg(args, 1, script)?,
            int_arg(args, 2, script)?,
        )
        .encode(),
        Script::FixedWindowLocked => engine::fixed_window_locked(
            ks,
            key(keys, 0, script)?,
            key(keys, 1, script)?,
            int_arg(args, 0, script)?,
            secs_arg(args, 1, script)?,
            int_arg(args, 2, script)?,
            secs_arg(args, 3, script)?,
        )
        .encode(),
        Script::Continuous => {
            let args = ContinuousArgs {
                capacity: int_arg(args, 0, script)?,
                rate: float_arg(args, 1, script)?,
                now: int_arg(args, 2, script)?,
                max_wait: int_arg(args, 3, script)?,
                requested: int_arg(args, 4, script)?,
            };
            engine::continuous(ks, key(keys, 0, script)?, key(keys, 1, script)?, args).encode()
        }
        Script::TryLock => {
            let acquired =
                engine::try_lock(ks, key(keys, 0, script)?, secs_arg(args, 0, script)?);
            vec![i64::from(acquired)]
        }
        Script::ReleaseLock => vec![i64::from(engine::release_lock(ks, key(keys, 0, script)?))],
    };
    Ok(reply)
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn load(&self, script: Script) -> Result<ScriptId, SubstrateError> {
        let mut state = self.lock_state()?;
        if let Some(id) = state.scripts.iter().find(|(_, s)| **s == script).map(|(id, _)| id) {
            return Ok(id.clone());
        }
        state.generation += 1;
        let id = ScriptId::new(format!("mem:{}:{}", script.name(), state.generation));
        state.scripts.insert(id.clone(), script);
        Ok(id)
    }

    async fn eval(
        &self,
        id: &ScriptId,
        keys: &[&str],
        args: &[ScriptArg],
    ) -> Result<Vec<i64>, SubstrateError> {
        let now_ms = self.clock.now_millis();
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let script = *state
            .scripts
            .get(id)
            .ok_or_else(|| SubstrateError::UnknownScript { id: id.clone() })?;
        let mut ks = MemoryKeyspace { entries: &mut state.entries, now_ms };
        execute(&mut ks, script, keys, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn ints(values: &[i64]) -> Vec<ScriptArg> {
        values.iter().copied().map(ScriptArg::Int).collect()
    }

    #[tokio::test]
    async fn load_is_idempotent_until_flush() {
        let substrate = InMemorySubstrate::new();
        let first = substrate.load(Script::FixedWindow).await.unwrap();
        let again = substrate.load(Script::FixedWindow).await.unwrap();
        assert_eq!(first, again);

        substrate.flush_scripts();
        let err = substrate.eval(&first, &["api"], &ints(&[10, 30, 1])).await;
        assert!(matches!(err, Err(SubstrateError::UnknownScript { .. })));

        let reloaded = substrate.load(Script::FixedWindow).await.unwrap();
        assert_ne!(first, reloaded);
    }

    #[tokio::test]
    async fn fixed_window_key_expires_with_clock() {
        let clock = ManualClock::at_secs(1_000);
        let substrate = InMemorySubstrate::with_clock(clock.clone());
        let id = substrate.load(Script::FixedWindow).await.unwrap();
        let args = ints(&[10, 30, 4]);

        assert_eq!(substrate.eval(&id, &["api"], &args).await.unwrap(), vec![1, 6]);
        assert_eq!(substrate.ttl_secs("api"), Some(30));

        clock.advance(Duration::from_secs(29));
        assert_eq!(substrate.eval(&id, &["api"], &args).await.unwrap(), vec![1, 2]);
        assert_eq!(substrate.ttl_secs("api"), Some(1));

        clock.advance(Duration::from_secs(1));
        assert_eq!(substrate.peek("api"), None);
        assert_eq!(substrate.eval(&id, &["api"], &args).await.unwrap(), vec![1, 6]);
    }

    #[tokio::test]
    async fn lock_scripts_round_trip() {
        let clock = ManualClock::new();
        let substrate = InMemorySubstrate::with_clock(clock.clone());
        let try_lock = substrate.load(Script::TryLock).await.unwrap();
        let release = substrate.load(Script::ReleaseLock).await.unwrap();

        assert_eq!(substrate.eval(&try_lock, &["api:lock"], &ints(&[5])).await.unwrap(), vec![1]);
        assert_eq!(substrate.eval(&try_lock, &["api:lock"], &ints(&[5])).await.unwrap(), vec![0]);
        assert_eq!(substrate.eval(&release, &["api:lock"], &[]).await.unwrap(), vec![1]);
        assert_eq!(substrate.eval(&release, &["api:lock"], &[]).await.unwrap(), vec![0]);

        substrate.eval(&try_lock, &["api:lock"], &ints(&[5])).await.unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(substrate.eval(&try_lock, &["api:lock"], &ints(&[5])).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn continuous_accepts_float_rate() {
        let substrate = InMemorySubstrate::new();
        let id = substrate.load(Script::Continuous).await.unwrap();
        let reply = substrate
            .eval(
                &id,
                &["api", "api:last_replenished"],
                &[
                    ScriptArg::Int(10),
                    ScriptArg::Float(0.33),
                    ScriptArg::Int(0),
                    ScriptArg::Int(10),
                    ScriptArg::Int(1),
                ],
            )
            .await
            .unwrap();
        assert_eq!(reply, vec![1, 0, 9]);
        assert_eq!(substrate.peek("api:last_replenished"), Some(0));
        assert_eq!(substrate.ttl_secs("api"), None);
    }

    #[tokio::test]
    async fn bad_arguments_are_execution_errors() {
        let substrate = InMemorySubstrate::new();
        let id = substrate.load(Script::FixedWindow).await.unwrap();

        let missing_key = substrate.eval(&id, &[], &ints(&[10, 30, 1])).await;
        assert!(matches!(missing_key, Err(SubstrateError::Execution { .. })));

        let args = [ScriptArg::Float(1.5), ScriptArg::Int(30), ScriptArg::Int(1)];
        let float_capacity = substrate.eval(&id, &["api"], &args).await;
        assert!(matches!(float_capacity, Err(SubstrateError::Execution { .. })));

        let negative_window = substrate.eval(&id, &["api"], &ints(&[10, -1, 1])).await;
        assert!(matches!(negative_window, Err(SubstrateError::Execution { .. })));
    }

    #[tokio::test]
    async fn decrement_keeps_ttl() {
        let clock = ManualClock::new();
        let substrate = InMemorySubstrate::with_clock(clock.clone());
        let id = substrate.load(Script::FixedWindow).await.unwrap();
        substrate.eval(&id, &["api"], &ints(&[10, 30, 1])).await.unwrap();
        clock.advance(Duration::from_secs(10));
        substrate.eval(&id, &["api"], &ints(&[10, 30, 1])).await.unwrap();
        assert_eq!(substrate.ttl_secs("api"), Some(20));
    }
}
