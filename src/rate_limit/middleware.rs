use crate::error::ThrottleError;
use crate::rate_limit::{Decision, RateLimiter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

/// A layer that admits requests through a [`RateLimiter`] before calling the inner service.
#[derive(Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    tokens: u64,
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: Arc::clone(&self.limiter), tokens: self.tokens }
    }
}

impl<L> RateLimitLayer<L> {
    /// Every request costs one token.
    pub fn new(limiter: L) -> Self {
        Self::from_arc(Arc::new(limiter))
    }

    /// Share a limiter that is also used elsewhere.
    pub fn from_arc(limiter: Arc<L>) -> Self {
        Self { limiter, tokens: 1 }
    }

    /// Charge `tokens` per request instead of one.
    pub fn with_cost(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: Arc::clone(&self.limiter), tokens: self.tokens }
    }
}

/// Middleware service that admits each request before forwarding it.
///
/// Denials become [`ThrottleError::RateLimited`] carrying the projected wait, a held lock
/// becomes [`ThrottleError::Locked`], and a failed decision becomes
/// [`ThrottleError::Admission`]: a request is never forwarded without a grant. A granted
/// `wait` is slept out before the inner call.
#[derive(Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    tokens: u64,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: Arc::clone(&self.limiter), tokens: self.tokens }
    }
}

impl<S, L, Req> Service<Req> for RateLimitService<S, L>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + Sync + std::error::Error + 'static,
    L: RateLimiter + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ThrottleError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ThrottleError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = Arc::clone(&self.limiter);
        let tokens = self.tokens;
        // Take the service that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.acquire(tokens).await {
                Ok(Decision::Allowed { wait, .. }) => {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    inner.call(req).await.map_err(ThrottleError::Inner)
                }
                Ok(Decision::Denied { wait, remaining }) => {
                    debug!(remaining, ?wait, "request rate limited");
                    Err(ThrottleError::RateLimited { wait })
                }
                Ok(Decision::Locked) => Err(ThrottleError::Locked),
                Err(e) => Err(ThrottleError::Admission(e)),
            }
        })
    }
}
