//! Redis substrate for `tollgate` (companion crate).
//! Bring your own `redis::aio::MultiplexedConnection`; every admission script runs as one
//! server-side Lua script, which Redis executes without interleaving other commands.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, RedisError, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tollgate::substrate::{Script, ScriptArg, ScriptId, Substrate, SubstrateError};

/// Lua source of `script`.
pub fn script_source(script: Script) -> &'static str {
    match script {
        Script::FixedWindow => include_str!("../scripts/fixed_window.lua"),
        Script::FixedWindowLocked => include_str!("../scripts/fixed_window_locked.lua"),
        Script::Continuous => include_str!("../scripts/continuous.lua"),
        Script::TryLock => include_str!("../scripts/try_lock.lua"),
        Script::ReleaseLock => include_str!("../scripts/release_lock.lua"),
    }
}

#[derive(Clone)]
pub struct RedisSubstrate {
    conn: MultiplexedConnection,
    loaded: Arc<Mutex<HashMap<ScriptId, Script>>>,
}

impl std::fmt::Debug for RedisSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubstrate")
            .field("conn", &"<redis::aio::MultiplexedConnection>")
            .finish()
    }
}

impl RedisSubstrate {
    /// Wrap an existing connection. Clones of the connection are used per call.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn, loaded: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, SubstrateError> {
        let client = redis::Client::open(url).map_err(|e| unavailable(&e))?;
        let conn = client.get_multiplexed_async_connection().await.map_err(|e| unavailable(&e))?;
        Ok(Self::new(conn))
    }

    fn script_name(&self, id: &ScriptId) -> &'static str {
        self.loaded
            .lock()
            .ok()
            .and_then(|loaded| loaded.get(id).map(|s| s.name()))
            .unwrap_or("<unknown>")
    }
}

fn unavailable(err: &RedisError) -> SubstrateError {
    SubstrateError::Unavailable { reason: err.to_string() }
}

fn classify(err: RedisError, id: &ScriptId) -> SubstrateError {
    if err.kind() == ErrorKind::NoScriptError {
        return SubstrateError::UnknownScript { id: id.clone() };
    }
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        return unavailable(&err);
    }
    tracing::warn!(
        target: "tollgate::redis",
        script = %id,
        error = %err,
        "script execution failed"
    );
    SubstrateError::Execution { reason: err.to_string() }
}

/// Flatten a script reply into integers. Anything but an array of integers is malformed.
fn parse_reply(value: Value, script: &'static str) -> Result<Vec<i64>, SubstrateError> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(SubstrateError::Malformed {
                script,
                reason: format!("expected an array, got {other:?}"),
            })
        }
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Int(v) => Ok(v),
            other => Err(SubstrateError::Malformed {
                script,
                reason: format!("element {index} is {other:?}, not an integer"),
            }),
        })
        .collect()
}

#[async_trait]
impl Substrate for RedisSubstrate {
    async fn load(&self, script: Script) -> Result<ScriptId, SubstrateError> {
        let mut conn = self.conn.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script_source(script))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    unavailable(&e)
                } else {
                    SubstrateError::Registration { script: script.name(), reason: e.to_string() }
                }
            })?;
        let id = ScriptId::new(sha);
        if let Ok(mut loaded) = self.loaded.lock() {
            loaded.insert(id.clone(), script);
        }
        tracing::debug!(target: "tollgate::redis", script = %script, sha = %id, "script loaded");
        Ok(id)
    }

    async fn eval(
        &self,
        id: &ScriptId,
        keys: &[&str],
        args: &[ScriptArg],
    ) -> Result<Vec<i64>, SubstrateError> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(id.as_str()).arg(keys.len());
        for key in keys {
            cmd.arg(*key);
        }
        for arg in args {
            match *arg {
                ScriptArg::Int(v) => cmd.arg(v),
                ScriptArg::Float(v) => cmd.arg(v),
            };
        }

        let mut conn = self.conn.clone();
        let value: Value = cmd.query_async(&mut conn).await.map_err(|e| classify(e, id))?;
        parse_reply(value, self.script_name(id))
    }
}
