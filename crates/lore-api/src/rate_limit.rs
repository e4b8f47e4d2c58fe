//! Token-bucket rate limiter middleware.
//!
//! The bucket holds up to `burst` tokens and refills at `per_minute / 60`
//! tokens per second. Each tool call takes one token; an empty bucket
//! answers 429 with the time until the next token.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Extension, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use lore_core::config::ApiConfig;
use lore_core::error::LoreError;

use crate::error::ApiError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Shared state for the rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    capacity: f64,
    /// Tokens added per second.
    refill: f64,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    /// A full bucket of `burst` tokens refilled at `per_minute` per minute.
    pub fn new(per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill: f64::from(per_minute) / 60.0,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last: Instant::now(),
            })),
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(config.rate_limit_per_minute, config.rate_limit_burst)
    }

    /// Take a token, or report how long until one is available.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill).min(self.capacity);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else if self.refill > 0.0 {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill))
        } else {
            Err(Duration::from_secs(60))
        }
    }
}

/// Axum middleware that enforces the rate limit.
pub async fn rate_limit_middleware(
    Extension(limiter): Extension<RateLimiter>,
    req: Request,
    next: Next,
) -> Response {
    match limiter.try_acquire() {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            tracing::warn!(retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
            ApiError(LoreError::ResourceExhausted {
                resource: "rate_limiter",
                retry_after,
            })
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_refill() {
        let limiter = RateLimiter::new(60, 3);
        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.try_acquire_at(start).is_ok());
        }
        let wait = limiter.try_acquire_at(start).unwrap_err();
        assert!(wait <= Duration::from_secs(1));

        // One token per second at 60/min.
        assert!(limiter.try_acquire_at(start + Duration::from_millis(1_100)).is_ok());
        assert!(limiter.try_acquire_at(start + Duration::from_millis(1_100)).is_err());
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let limiter = RateLimiter::new(600, 2);
        let start = Instant::now();
        let later = start + Duration::from_secs(3_600);
        assert!(limiter.try_acquire_at(later).is_ok());
        assert!(limiter.try_acquire_at(later).is_ok());
        assert!(limiter.try_acquire_at(later).is_err());
    }
}
