// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the helm daemon HTTP API.

use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RequestId middleware
// ---------------------------------------------------------------------------

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Generates a [`RequestId`] per request and echoes it as `X-Request-Id`.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

// ---------------------------------------------------------------------------
// Request logger
// ---------------------------------------------------------------------------

/// Logs method, path, status, and duration for each request.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = start.elapsed().as_millis() as u64,
        "request completed"
    );
    resp
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Simple in-memory sliding-window rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    /// Allow `max_requests` within `window`.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
        }
    }

    /// Record one request, rejecting when the window is full.
    pub async fn check(&self) -> Result<(), StatusCode> {
        let now = Instant::now();
        let mut timestamps = self.inner.lock().await;

        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() as u32 >= self.max_requests {
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
        timestamps.push_back(now);
        Ok(())
    }

    /// Axum middleware wrapper around [`RateLimiter::check`].
    pub async fn middleware(
        limiter: RateLimiter,
        req: Request,
        next: Next,
    ) -> Response {
        match limiter.check().await {
            Ok(()) => next.run(req).await,
            Err(status) => (status, "too many requests").into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limiter_allows_within_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.check().await.is_ok());
        }
        assert_eq!(limiter.check().await, Err(StatusCode::TOO_MANY_REQUESTS));
    }

    #[tokio::test]
    async fn limiter_expires_old_entries() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check().await.is_ok());
        assert!(limiter.check().await.is_err());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(limiter.check().await.is_ok());
    }
}
