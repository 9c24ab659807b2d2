//! Tower layer translating limiter outcomes into HTTP responses.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, error, warn};

use super::key::KeyExtractor;
use crate::ratelimit::{LimitStatus, Limiter, RateLimitError};

/// Header carrying the configured limit.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the remaining quota.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Header carrying the reset time as an HTTP date.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// A layer that charges each request against a [`Limiter`].
pub struct RateLimitLayer<L: ?Sized, K> {
    limiter: Arc<L>,
    extractor: Arc<K>,
    weight: u64,
}

impl<L: ?Sized, K> RateLimitLayer<L, K> {
    /// Charge one unit per request, keyed by `extractor`.
    pub fn new(limiter: Arc<L>, extractor: K) -> Self {
        Self {
            limiter,
            extractor: Arc::new(extractor),
            weight: 1,
        }
    }

    /// Charge `weight` units per request instead of one.
    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }
}

impl<L: ?Sized, K> Clone for RateLimitLayer<L, K> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            weight: self.weight,
        }
    }
}

impl<S, L: ?Sized, K> Layer<S> for RateLimitLayer<L, K> {
    type Service = RateLimitService<S, L, K>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            weight: self.weight,
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
///
/// Admitted requests are forwarded and the response is decorated with
/// `X-RateLimit-*` headers. Requests over quota get `429 Too Many Requests`
/// with the same headers plus `Retry-After`. Key extraction and store failures
/// get `500 Internal Server Error`; the inner service is not called.
pub struct RateLimitService<S, L: ?Sized, K> {
    inner: S,
    limiter: Arc<L>,
    extractor: Arc<K>,
    weight: u64,
}

impl<S: Clone, L: ?Sized, K> Clone for RateLimitService<S, L, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            weight: self.weight,
        }
    }
}

impl<S, L, K, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, L, K>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: Limiter + ?Sized + 'static,
    K: KeyExtractor + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let limiter = self.limiter.clone();
        let extractor = self.extractor.clone();
        let weight = self.weight;
        // Take the service that was driven to readiness and leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let key = match extractor.extract(req.headers(), req.extensions()) {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Failed to derive rate limit key");
                    return Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR));
                }
            };

            match limiter.increment(&key, weight).await {
                Ok(status) => {
                    let mut response = inner.call(req).await?;
                    set_limit_headers(response.headers_mut(), &status);
                    Ok(response)
                }
                Err(RateLimitError::Exceeded(status)) => {
                    debug!(key = %key, reset = %status.reset, "Rejecting request over rate limit");
                    let mut response = empty_response(StatusCode::TOO_MANY_REQUESTS);
                    let headers = response.headers_mut();
                    set_limit_headers(headers, &status);
                    if let Some(reset) = http_date(status.reset) {
                        headers.insert(RETRY_AFTER, reset);
                    }
                    Ok(response)
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Rate limiter failed");
                    Ok(empty_response(StatusCode::INTERNAL_SERVER_ERROR))
                }
            }
        })
    }
}

fn empty_response<B: Default>(status: StatusCode) -> Response<B> {
    let mut response = Response::new(B::default());
    *response.status_mut() = status;
    response
}

fn set_limit_headers(headers: &mut HeaderMap, status: &LimitStatus) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(status.remaining));
    if let Some(reset) = http_date(status.reset) {
        headers.insert(X_RATELIMIT_RESET, reset);
    }
}

/// Format `at` as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(at: DateTime<Utc>) -> Option<HeaderValue> {
    let formatted = at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    HeaderValue::from_str(&formatted).ok()
}
