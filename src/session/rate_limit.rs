//! Per-identity session creation limits
//!
//! Fixed window anchored at the first request: up to `points` requests pass
//! within `window`; the next one is refused and starts a block of
//! `block_duration`, during which every request is refused. A zero block
//! duration disables blocking.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub points: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: 10,
            window: Duration::from_secs(3600),
            block_duration: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

/// Outcome of a refused request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    /// How long until a request may succeed
    pub retry_after: Duration,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one point for `key`
    pub fn check(&self, key: &str) -> Result<(), RateLimited> {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return Err(RateLimited {
                    retry_after: until - now,
                });
            }
            bucket.blocked_until = None;
            bucket.count = 0;
            bucket.window_start = now;
        }

        if now.duration_since(bucket.window_start) >= self.config.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count >= self.config.points {
            let window_end = bucket.window_start + self.config.window;
            if self.config.block_duration.is_zero() {
                return Err(RateLimited {
                    retry_after: window_end.saturating_duration_since(now),
                });
            }
            let until = now + self.config.block_duration;
            bucket.blocked_until = Some(until);
            return Err(RateLimited {
                retry_after: self.config.block_duration,
            });
        }

        bucket.count += 1;
        Ok(())
    }

    /// Forget buckets whose window and block have both expired
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let blocked = bucket.blocked_until.map(|u| now < u).unwrap_or(false);
            blocked || now.duration_since(bucket.window_start) < self.config.window
        });
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(points: u32, window_secs: u64, block_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            points,
            window: Duration::from_secs(window_secs),
            block_duration: Duration::from_secs(block_secs),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_without_block() {
        let limiter = limiter(3, 60, 0);
        for _ in 0..3 {
            assert!(limiter.check("alice").is_ok());
        }
        let refused = limiter.check("alice").unwrap_err();
        assert_eq!(refused.retry_after, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check("alice").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exceeding_starts_block() {
        let limiter = limiter(2, 60, 600);
        assert!(limiter.check("bob").is_ok());
        assert!(limiter.check("bob").is_ok());
        assert!(limiter.check("bob").is_err());

        // Window elapsed but the block still holds
        tokio::time::advance(Duration::from_secs(120)).await;
        let refused = limiter.check("bob").unwrap_err();
        assert_eq!(refused.retry_after, Duration::from_secs(480));

        tokio::time::advance(Duration::from_secs(480)).await;
        assert!(limiter.check("bob").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identities_are_independent() {
        let limiter = limiter(1, 60, 60);
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_expired_buckets() {
        let limiter = limiter(1, 60, 300);
        limiter.check("idle").unwrap();
        limiter.check("blocked").unwrap();
        let _ = limiter.check("blocked");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.prune(), 1);
        assert_eq!(limiter.len(), 1);
    }
}
