//! Sliding-window rate limiter for the gateway.
//!
//! One window per agent id. The per-request ceiling comes from the caller's
//! session token, so agents minted with different limits share one limiter.
//! Stale buckets are collected periodically to bound memory.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// GC interval: drop idle buckets every 5 minutes.
const GC_INTERVAL_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Window duration in seconds.
    pub window_secs: u64,
    /// Ceiling applied when a token carries no limit of its own.
    pub default_max_requests: u32,
}

impl RateLimitConfig {
    pub const fn new(default_max_requests: u32, window_secs: u64) -> Self {
        Self {
            window_secs,
            default_max_requests,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(60, 60)
    }
}

struct Bucket {
    timestamps: Vec<Instant>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            timestamps: Vec::new(),
        }
    }

    /// Prune timestamps older than the window, then admit or refuse. On refusal
    /// returns the seconds until the oldest entry leaves the window.
    fn check_and_record(&mut self, window: Duration, max_requests: u32) -> Result<(), u64> {
        let now = Instant::now();
        self.timestamps.retain(|t| now.duration_since(*t) < window);

        if (self.timestamps.len() as u32) < max_requests {
            self.timestamps.push(now);
            return Ok(());
        }
        let retry_after = self
            .timestamps
            .first()
            .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(window);
        Err(retry_after.as_secs().max(1))
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    last_gc: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            last_gc: Mutex::new(Instant::now()),
        }
    }

    /// Admit one request for `key` against `max_requests` per window.
    ///
    /// A zero ceiling falls back to the configured default.
    pub fn check(&self, key: &str, max_requests: u32) -> Result<(), u64> {
        let window = Duration::from_secs(self.config.window_secs);
        let max_requests = if max_requests == 0 {
            self.config.default_max_requests
        } else {
            max_requests
        };
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        {
            let mut last_gc = self.last_gc.lock().unwrap_or_else(|e| e.into_inner());
            if last_gc.elapsed().as_secs() >= GC_INTERVAL_SECS {
                let now = Instant::now();
                buckets.retain(|_, b| {
                    b.timestamps
                        .last()
                        .is_some_and(|t| now.duration_since(*t) < window * 2)
                });
                *last_gc = now;
            }
        }

        buckets
            .entry(key.to_string())
            .or_insert_with(Bucket::new)
            .check_and_record(window, max_requests)
    }

    pub fn forget(&self, key: &str) {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
