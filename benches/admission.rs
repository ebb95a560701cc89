use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::future::Ready;
use std::sync::Arc;
use tollgate::{
    AdmissionGateway, BucketKeys, InMemorySubstrate, Policy, RateLimitLayer, Request, TokenBucket,
};
use tower::{Service, ServiceBuilder};

// A simple service that just returns its input.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

fn gateway_decisions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let gateway = Arc::new(AdmissionGateway::new(InMemorySubstrate::new()));
    rt.block_on(gateway.preload()).unwrap();
    let fixed_keys = BucketKeys::new("bench:fixed").unwrap();
    let continuous_keys = BucketKeys::new("bench:continuous").unwrap();

    let fixed = Policy::fixed_window(i64::MAX as u64, 3_600).unwrap();
    c.bench_function("gateway_fixed_window", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(gateway.admit(&fixed_keys, &fixed, Request::one(), 0).await);
        });
    });

    // Denials take the same path as grants; the bucket drains quickly here.
    let continuous = Policy::continuous(1_000_000, 1_000.0, 60).unwrap();
    let now = 1_700_000_000;
    c.bench_function("gateway_continuous", |b| {
        b.to_async(&rt).iter(|| async {
            let d = gateway.admit(&continuous_keys, &continuous, Request::one(), now).await;
            let _ = black_box(d);
        });
    });
}

fn middleware_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let policy = Policy::fixed_window(i64::MAX as u64, 3_600).unwrap();
    let bucket = TokenBucket::new(InMemorySubstrate::new(), "bench", policy).unwrap();
    let svc = ServiceBuilder::new().layer(RateLimitLayer::new(bucket)).service(EchoService);

    c.bench_function("rate_limit_layer_granted", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

criterion_group!(benches, gateway_decisions, middleware_throughput);
criterion_main!(benches);
