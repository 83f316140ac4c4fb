//! Flow limiter
//!
//! Token bucket guarding the mutating RPCs (create/drop table, route).
//! Tokens refill continuously at `limit` per second up to `burst`; each
//! admitted request takes one token. Settings are mutable at runtime
//! through the HTTP API.

use std::time::Instant;

use parking_lot::Mutex;
use tracing::info;

use crate::config::FlowLimiterConfig;
use crate::error::{MetaError, Result};

struct Bucket {
    enable: bool,
    limit: u64,
    burst: u64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit as f64).min(self.burst as f64);
        self.last_refill = now;
    }
}

/// Global admission control for mutating requests
pub struct FlowLimiter {
    bucket: Mutex<Bucket>,
}

impl FlowLimiter {
    pub fn new(config: FlowLimiterConfig) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                enable: config.enable,
                limit: config.limit,
                burst: config.burst,
                tokens: config.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token; `resource_exhausted` when the bucket is empty.
    pub fn take(&self) -> Result<()> {
        let mut bucket = self.bucket.lock();
        if !bucket.enable {
            return Ok(());
        }
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(MetaError::resource_exhausted("flow limit reached"))
        }
    }

    /// Replace the limiter settings; the bucket restarts full.
    pub fn update(&self, config: FlowLimiterConfig) {
        let mut bucket = self.bucket.lock();
        bucket.enable = config.enable;
        bucket.limit = config.limit;
        bucket.burst = config.burst;
        bucket.tokens = config.burst as f64;
        bucket.last_refill = Instant::now();
        info!(
            "flow limiter updated: enable={}, limit={}, burst={}",
            config.enable, config.limit, config.burst
        );
    }

    pub fn config(&self) -> FlowLimiterConfig {
        let bucket = self.bucket.lock();
        FlowLimiterConfig {
            enable: bucket.enable,
            limit: bucket.limit,
            burst: bucket.burst,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(enable: bool, limit: u64, burst: u64) -> FlowLimiter {
        FlowLimiter::new(FlowLimiterConfig {
            enable,
            limit,
            burst,
        })
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = limiter(true, 1, 1);
        assert!(limiter.take().is_ok());
        let err = limiter.take().unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ResourceExhausted);
        assert!(err.to_string().contains("flow limit reached"));
    }

    #[test]
    fn test_refill_admits_again() {
        let limiter = limiter(true, 1000, 1);
        assert!(limiter.take().is_ok());
        assert!(limiter.take().is_err());
        std::thread::sleep(Duration::from_millis(5));
        assert!(limiter.take().is_ok());
    }

    #[test]
    fn test_disabled_never_rejects() {
        let limiter = limiter(false, 1, 1);
        for _ in 0..100 {
            assert!(limiter.take().is_ok());
        }
    }

    #[test]
    fn test_update_resets_bucket() {
        let limiter = limiter(true, 1, 1);
        assert!(limiter.take().is_ok());
        assert!(limiter.take().is_err());
        limiter.update(FlowLimiterConfig {
            enable: true,
            limit: 1,
            burst: 2,
        });
        assert!(limiter.take().is_ok());
        assert!(limiter.take().is_ok());
        assert_eq!(limiter.config().burst, 2);
    }
}
