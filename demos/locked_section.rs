//! One caller at a time: a fixed-window bucket whose grants also take the bucket's lock.
use std::time::Duration;
use tollgate::{InMemorySubstrate, Policy, TokenBucket};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let policy = Policy::fixed_window(10, 30)?.with_lock(30)?;
    let bucket = TokenBucket::new(InMemorySubstrate::new(), "token_bucket", policy)?;

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let holder = tokio::spawn({
        let bucket = bucket.clone();
        async move {
            bucket
                .run_exclusive(1, move || async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "mock API call finished"
                })
                .await
        }
    });

    started_rx.await?;
    let contender = bucket.acquire(1).await?;
    println!("while the section runs: {contender:?}");
    assert!(contender.is_locked());

    match holder.await?? {
        Ok(message) => println!("{message}"),
        Err(decision) => println!("section did not run: {decision:?}"),
    }

    let after = bucket.acquire(1).await?;
    println!("after release: {after:?}");
    bucket.release_lock().await?;
    Ok(())
}
