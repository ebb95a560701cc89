#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Distributed token-bucket admission control: many independent processes share one bucket
//! per resource key in a store, and every check-and-decrement happens as a single atomic
//! step inside that store.
//!
//! ## Features
//!
//! - **Fixed-window** buckets that refill to capacity when their TTL lapses
//! - **Continuous** buckets that replenish at a fractional rate and grant ahead of time within
//!   a bounded wait
//! - **Bucket lock** taken atomically with a grant, for one-at-a-time critical sections
//! - **Pluggable substrate**: in-memory for tests and single processes, Redis via
//!   `tollgate-redis`
//! - **Tower middleware** and telemetry sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{Decision, InMemorySubstrate, Policy, TokenBucket};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let policy = Policy::continuous(10, 0.33, 10)?;
//!     let bucket = TokenBucket::new(InMemorySubstrate::new(), "token_bucket", policy)?;
//!
//!     match bucket.acquire(1).await? {
//!         Decision::Allowed { remaining, wait } => {
//!             // The tokens are ours; act once `wait` has passed.
//!             println!("granted, {remaining} left, wait {wait:?}");
//!         }
//!         Decision::Denied { wait, .. } => println!("denied, would need {wait:?}"),
//!         Decision::Locked => println!("someone else holds the lock"),
//!     }
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod policy;
pub mod prelude;
pub mod rate_limit;
pub mod sleeper;
pub mod substrate;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AdmissionError, ThrottleError};
pub use gateway::AdmissionGateway;
pub use lock::LockCoordinator;
pub use policy::{BucketKeys, LivePolicy, Policy, PolicyError, Request};
pub use rate_limit::{Decision, RateLimitLayer, RateLimitService, RateLimiter, TokenBucket};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use substrate::{InMemorySubstrate, Script, ScriptArg, ScriptId, Substrate, SubstrateError};
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};
