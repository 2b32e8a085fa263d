//! Per-target rate limiting.
//!
//! Every query target gets a token bucket shared by all executions, so
//! concurrent runs hitting the same target draw from one budget. Callers
//! `acquire` before each call and wait until a token frees up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per time window
    pub requests_per_window: u32,
    /// Time window duration
    pub window: Duration,
    /// Burst size (tokens available immediately)
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(30)
    }
}

impl RateLimitConfig {
    /// Create a config with requests per minute.
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests_per_window: requests,
            window: Duration::from_secs(60),
            burst_size: requests.clamp(1, 5),
        }
    }

    /// Set burst size.
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst_size = burst.max(1);
        self
    }

    fn refill_interval(&self) -> Duration {
        if self.requests_per_window == 0 {
            return self.window;
        }
        self.window / self.requests_per_window
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for a single target.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    /// Tokens added per second
    refill_per_sec: f64,
    refill_interval: Duration,
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        let window = config.window.as_secs_f64();
        let refill_per_sec = if window > 0.0 {
            config.requests_per_window as f64 / window
        } else {
            config.requests_per_window as f64
        };

        Self {
            state: Mutex::new(BucketState {
                tokens: config.burst_size as f64,
                last_refill: Instant::now(),
            }),
            capacity: config.burst_size as f64,
            refill_per_sec,
            refill_interval: config.refill_interval(),
        }
    }

    /// Take a token if one is available.
    ///
    /// On failure returns how long until the next token is due.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }

        if self.refill_per_sec <= 0.0 {
            return Err(self.refill_interval);
        }
        let missing = 1.0 - state.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_sec))
    }

    /// Currently available whole tokens.
    pub fn available_tokens(&self) -> u32 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.refill_per_sec)
            .min(self.capacity)
            .floor() as u32
    }
}

/// Rate limiters for all query targets.
#[derive(Clone)]
pub struct TargetRateLimiter {
    buckets: Arc<RwLock<HashMap<String, Arc<TokenBucket>>>>,
    config: RateLimitConfig,
}

impl TargetRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    fn bucket(&self, target_id: &str) -> Arc<TokenBucket> {
        {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bucket) = buckets.get(target_id) {
                return bucket.clone();
            }
        }

        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(target_id.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(&self.config)))
            .clone()
    }

    /// Take a token for `target_id` without waiting.
    pub fn try_acquire(&self, target_id: &str) -> bool {
        self.bucket(target_id).try_acquire().is_ok()
    }

    /// Wait until a token for `target_id` is available, then take it.
    pub async fn acquire(&self, target_id: &str) {
        let bucket = self.bucket(target_id);
        while let Err(wait) = bucket.try_acquire() {
            tracing::debug!(target_id, wait_ms = wait.as_millis() as u64, "Rate limited");
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    pub fn available_tokens(&self, target_id: &str) -> u32 {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        match buckets.get(target_id) {
            Some(bucket) => bucket.available_tokens(),
            None => self.config.burst_size,
        }
    }
}

impl Default for TargetRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
