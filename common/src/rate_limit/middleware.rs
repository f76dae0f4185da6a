use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
};
use tower::{Layer, Service};

use crate::rate_limit::RateLimiter;

/// Per-caller quota attached to the request by whatever middleware
/// authenticated it. Requests without one are not limited.
#[derive(Clone, Debug)]
pub struct RateLimitKey {
    /// Limiter key, e.g. `key:{api_key_id}`.
    pub key: String,
    /// The caller's own long-window quota, when it has one.
    pub long_limit: Option<i64>,
}

/// A Tower layer for Axum that rate-limits requests by the [`RateLimitKey`]
/// stored in the request extensions.
///
/// Behavior:
/// - If no `RateLimitKey` is present: skips rate limiting (passes through).
///   Unauthenticated routes and CORS preflights never carry one.
/// - If denied by the limiter (or the limiter is unreachable): returns
///   `429 Too Many Requests`.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S> Service<Request<Body>> for RateLimitMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Only apply when an upstream middleware attached a quota key.
            let Some(quota) = req.extensions().get::<RateLimitKey>().cloned() else {
                return inner.call(req).await;
            };

            let allowed = limiter.check(&quota.key, quota.long_limit).await;
            if !allowed {
                metrics::counter!("rate_limited_requests_total").increment(1);
                return Ok(Response::builder()
                    .status(StatusCode::TOO_MANY_REQUESTS)
                    .header("content-type", "text/plain; charset=utf-8")
                    .body(Body::from("Too Many Requests"))
                    .unwrap());
            }

            inner.call(req).await
        })
    }
}
