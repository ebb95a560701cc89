//! Telemetry for admission decisions.
//!
//! Every decision a [`TokenBucket`](crate::TokenBucket) makes is reported as an
//! [`AdmissionEvent`] to a [`TelemetrySink`]. Sinks are plain `tower::Service`s, so they can
//! be wrapped with the usual tower combinators. Emission is best effort: a sink that is not
//! ready or fails never affects the decision.
//!
//! ```rust
//! use tollgate::telemetry::AdmissionEvent;
//! use std::time::Duration;
//!
//! let event = AdmissionEvent::Granted {
//!     key: "token_bucket".into(),
//!     tokens: 1,
//!     remaining: 9,
//!     wait: Duration::ZERO,
//! };
//! assert!(event.to_string().contains("remaining=9"));
//! ```

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AdmissionEvent {
    /// Tokens were consumed. `wait` is non-zero when the grant was made ahead of time.
    Granted { key: String, tokens: u64, remaining: i64, wait: Duration },
    /// The bucket could not cover the request.
    Denied { key: String, tokens: u64, remaining: i64, wait: Duration },
    /// Another caller held the bucket's lock.
    Locked { key: String },
    /// The bucket's lock was released after a critical section.
    LockReleased { key: String },
    /// No decision could be made.
    Failed { key: String, reason: String },
}

impl AdmissionEvent {
    /// Bucket key the event concerns.
    pub fn key(&self) -> &str {
        match self {
            AdmissionEvent::Granted { key, .. }
            | AdmissionEvent::Denied { key, .. }
            | AdmissionEvent::Locked { key }
            | AdmissionEvent::LockReleased { key }
            | AdmissionEvent::Failed { key, .. } => key,
        }
    }

    /// Short stable label, handy as a metric name suffix.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Granted { .. } => "granted",
            AdmissionEvent::Denied { .. } => "denied",
            AdmissionEvent::Locked { .. } => "locked",
            AdmissionEvent::LockReleased { .. } => "lock_released",
            AdmissionEvent::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Granted { key, tokens, remaining, wait } => {
                write!(f, "Admission::Granted(key={key}, tokens={tokens}, ")?;
                write!(f, "remaining={remaining}, wait={wait:?})")
            }
            AdmissionEvent::Denied { key, tokens, remaining, wait } => {
                write!(f, "Admission::Denied(key={key}, tokens={tokens}, ")?;
                write!(f, "remaining={remaining}, wait={wait:?})")
            }
            AdmissionEvent::Locked { key } => write!(f, "Admission::Locked(key={key})"),
            AdmissionEvent::LockReleased { key } => {
                write!(f, "Admission::LockReleased(key={key})")
            }
            AdmissionEvent::Failed { key, reason } => {
                write!(f, "Admission::Failed(key={key}, reason={reason})")
            }
        }
    }
}

/// Render an event as a flat JSON object.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &AdmissionEvent) -> serde_json::Value {
    use serde_json::json;

    let mut value = json!({ "kind": event.kind(), "key": event.key() });
    let extra = match event {
        AdmissionEvent::Granted { tokens, remaining, wait, .. }
        | AdmissionEvent::Denied { tokens, remaining, wait, .. } => json!({
            "tokens": tokens,
            "remaining": remaining,
            "wait_ms": u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
        }),
        AdmissionEvent::Failed { reason, .. } => json!({ "reason": reason }),
        _ => json!({}),
    };
    if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    value
}

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
///
/// Grants are logged at DEBUG, everything else at INFO, except failures which go to WARN.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match &event {
            AdmissionEvent::Granted { .. } => tracing::debug!(event = %event, "admission_event"),
            AdmissionEvent::Failed { .. } => tracing::warn!(event = %event, "admission_event"),
            _ => tracing::info!(event = %event, "admission_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory.
///
/// Bounded; the oldest events are evicted once `capacity` is reached.
///
/// ```rust
/// use tollgate::telemetry::{AdmissionEvent, MemorySink};
/// use tower::Service;
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut sink = MemorySink::new();
/// let event = AdmissionEvent::Locked { key: "token_bucket".into() };
/// sink.call(event.clone()).await.unwrap();
/// assert_eq!(sink.events(), vec![event]);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the stored events.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Number of stored events of the given [`AdmissionEvent::kind`].
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| e.kind() == kind).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        if let Ok(mut guard) = self.events.lock() {
            if guard.len() >= self.capacity {
                guard.remove(0);
                self.evicted.fetch_add(1, Ordering::Relaxed);
            }
            guard.push(event);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// A sink that broadcasts events to any number of subscribers.
///
/// Receivers that fall behind miss events; with no receivers, events are counted as dropped.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: tokio::sync::broadcast::Sender<AdmissionEvent>,
    dropped: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { sender, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AdmissionEvent> {
        self.sender.subscribe()
    }

    /// Events sent while nobody was subscribed.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<AdmissionEvent> for StreamingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for StreamingSink {
    type SinkError = Infallible;
}
