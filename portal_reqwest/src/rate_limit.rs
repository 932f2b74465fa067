use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

/// Sliding-window limit on outbound requests, tracked per host
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    sent: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Allows at most `limit` requests to any one host within `window`
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            window,
            limit,
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// The most requests allowed per window
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The length of the sliding window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Counts a request to `host` if the limit allows it
    ///
    /// When the limit has been reached, returns how long until the oldest
    /// request in the window ages out.
    pub fn try_acquire(&self, host: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        let times = sent.entry(host.to_owned()).or_default();

        while let Some(&front) = times.front() {
            if now.duration_since(front) >= self.window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() < self.limit {
            times.push_back(now);
            Ok(())
        } else {
            let oldest = times.front().copied().unwrap_or(now);
            Err(self.window.saturating_sub(now.duration_since(oldest)))
        }
    }
}

impl Default for RateLimiter {
    /// 100 requests per minute
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}
