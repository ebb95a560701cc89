mod common;

use common::DownSubstrate;
use std::time::Duration;
use tollgate::{InMemorySubstrate, Policy, RateLimitLayer, ThrottleError, TokenBucket};
use tower::{service_fn, ServiceBuilder, ServiceExt};

async fn echo_len(req: &'static str) -> Result<usize, std::io::Error> {
    Ok(req.len())
}

#[tokio::test]
async fn forwards_until_the_bucket_is_empty() {
    let bucket =
        TokenBucket::new(InMemorySubstrate::new(), "api", Policy::fixed_window(2, 30).unwrap())
            .unwrap();
    let svc =
        ServiceBuilder::new().layer(RateLimitLayer::new(bucket)).service(service_fn(echo_len));

    assert_eq!(svc.clone().oneshot("hello").await.unwrap(), 5);
    assert_eq!(svc.clone().oneshot("hi").await.unwrap(), 2);

    let err = svc.clone().oneshot("again").await.unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(err.retry_after(), Some(Duration::ZERO));
}

#[tokio::test]
async fn cost_is_charged_per_request() {
    let bucket =
        TokenBucket::new(InMemorySubstrate::new(), "api", Policy::fixed_window(10, 30).unwrap())
            .unwrap();
    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(bucket).with_cost(4))
        .service(service_fn(echo_len));

    svc.clone().oneshot("a").await.unwrap();
    svc.clone().oneshot("b").await.unwrap();
    assert!(svc.clone().oneshot("c").await.unwrap_err().is_rate_limited());
}

#[tokio::test]
async fn continuous_denial_reports_projected_wait() {
    let bucket = TokenBucket::new(
        InMemorySubstrate::new(),
        "api",
        Policy::continuous(1, 0.5, 0).unwrap(),
    )
    .unwrap();
    let svc =
        ServiceBuilder::new().layer(RateLimitLayer::new(bucket)).service(service_fn(echo_len));

    svc.clone().oneshot("a").await.unwrap();
    let err = svc.clone().oneshot("b").await.unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
}

#[tokio::test]
async fn held_lock_is_surfaced() {
    let policy = Policy::fixed_window(10, 30).unwrap().with_lock(30).unwrap();
    let bucket = TokenBucket::new(InMemorySubstrate::new(), "api", policy).unwrap();
    let svc =
        ServiceBuilder::new().layer(RateLimitLayer::new(bucket)).service(service_fn(echo_len));

    svc.clone().oneshot("first").await.unwrap();
    assert!(svc.clone().oneshot("second").await.unwrap_err().is_locked());
}

#[tokio::test]
async fn unreachable_store_never_forwards() {
    let bucket = TokenBucket::new(DownSubstrate, "api", Policy::fixed_window(10, 30).unwrap())
        .unwrap();
    let svc =
        ServiceBuilder::new().layer(RateLimitLayer::new(bucket)).service(service_fn(echo_len));

    match svc.oneshot("hello").await {
        Err(ThrottleError::Admission(e)) => assert!(e.is_unavailable()),
        other => panic!("expected admission failure, got {other:?}"),
    }
}

#[tokio::test]
async fn inner_errors_pass_through() {
    let bucket =
        TokenBucket::new(InMemorySubstrate::new(), "api", Policy::fixed_window(10, 30).unwrap())
            .unwrap();
    let failing = service_fn(|_req: &'static str| async {
        Err::<usize, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    });
    let svc = ServiceBuilder::new().layer(RateLimitLayer::new(bucket)).service(failing);

    let err = svc.oneshot("x").await.unwrap_err();
    assert_eq!(err.into_inner().map(|e| e.to_string()), Some("boom".to_string()));
}
