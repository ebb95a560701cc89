//! Convenient re-exports for common Tollgate types.
pub use crate::{
    error::{AdmissionError, ThrottleError},
    policy::{Policy, Request},
    rate_limit::{Decision, RateLimitLayer, RateLimiter, TokenBucket},
    substrate::{InMemorySubstrate, Substrate},
    telemetry::{LogSink, MemorySink, NullSink, TelemetrySink},
};
