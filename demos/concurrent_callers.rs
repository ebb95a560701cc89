//! Two callers share one continuously replenished bucket until Ctrl-C (or 20 seconds).
//!
//! Each caller asks for a token, waits out any granted `time_to_wait`, then "calls the API".
//! Run with `cargo run --example concurrent_callers`.
use std::time::Duration;
use tokio::sync::watch;
use tollgate::{Decision, InMemorySubstrate, LogSink, Policy, TokenBucket};

async fn caller(
    name: &'static str,
    bucket: TokenBucket<InMemorySubstrate, LogSink>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u32, tollgate::AdmissionError> {
    let mut calls = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(calls),
            decision = bucket.acquire_and_wait(1) => match decision? {
                Decision::Allowed { remaining, wait } => {
                    calls += 1;
                    println!("{name}: API call #{calls} (remaining {remaining}, waited {wait:?})");
                }
                Decision::Denied { wait, .. } => {
                    println!("{name}: denied, replenishment is {wait:?} away");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Decision::Locked => tokio::time::sleep(Duration::from_millis(100)).await,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let policy = Policy::continuous(10, 0.33, 10)?;
    let bucket =
        TokenBucket::new(InMemorySubstrate::new(), "token_bucket", policy)?.with_sink(LogSink);

    let (stop_tx, stop_rx) = watch::channel(false);
    let first = tokio::spawn(caller("caller-1", bucket.clone(), stop_rx.clone()));
    let second = tokio::spawn(caller("caller-2", bucket, stop_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(20)) => println!("time is up"),
    }
    let _ = stop_tx.send(true);

    let total = first.await?? + second.await??;
    println!("{total} calls admitted");
    Ok(())
}
