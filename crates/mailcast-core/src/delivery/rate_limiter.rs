//! Rate Limiter - Caps how many sends start within a rolling window

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use mailcast_common::config::QueueConfig;

/// Sliding-log rate limiter shared by every delivery worker.
///
/// At most `max_permits` acquisitions happen within any `window`, across all
/// campaigns.
pub struct RateLimiter {
    max_permits: usize,
    window: Duration,
    log: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_permits: usize, window: Duration) -> Self {
        let max_permits = max_permits.max(1);
        Self {
            max_permits,
            window,
            log: Mutex::new(VecDeque::with_capacity(max_permits)),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.rate_limit_max, config.rate_limit_window())
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until a permit is available and take it
    pub async fn acquire(&self) {
        loop {
            let retry_at = {
                let mut log = self.log.lock().await;
                let now = Instant::now();
                self.prune(&mut log, now);

                if log.len() < self.max_permits {
                    log.push_back(now);
                    return;
                }

                // Oldest entry leaves the window first
                match log.front() {
                    Some(oldest) => *oldest + self.window,
                    None => now,
                }
            };

            trace!("rate limit reached, waiting for a free slot");
            tokio::time::sleep_until(retry_at).await;
        }
    }

    /// Take a permit if one is free right now
    pub async fn try_acquire(&self) -> bool {
        let mut log = self.log.lock().await;
        let now = Instant::now();
        self.prune(&mut log, now);

        if log.len() < self.max_permits {
            log.push_back(now);
            true
        } else {
            false
        }
    }

    /// Permits available right now
    #[cfg(test)]
    pub async fn remaining(&self) -> usize {
        let mut log = self.log.lock().await;
        self.prune(&mut log, Instant::now());
        self.max_permits - log.len()
    }

    fn prune(&self, log: &mut VecDeque<Instant>, now: Instant) {
        while log
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            log.pop_front();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_until_exhausted() {
        let limiter = RateLimiter::new(3, Duration::from_secs(1));
        assert_eq!(limiter.remaining().await, 3);

        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
        assert_eq!(limiter.remaining().await, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.remaining().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_window_exceeds_limit() {
        let limiter = Arc::new(RateLimiter::default());
        assert_eq!(limiter.max_permits(), 50);

        let mut handles = Vec::new();
        for _ in 0..175 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut started = Vec::new();
        for handle in handles {
            started.push(handle.await.unwrap());
        }
        started.sort();

        // Any 51 consecutive starts must span at least one full window
        for pair in started.windows(51) {
            assert!(pair[50].duration_since(pair[0]) >= limiter.window());
        }

        let first = started[0];
        let in_first_window = started
            .iter()
            .filter(|t| t.duration_since(first) < limiter.window())
            .count();
        assert_eq!(in_first_window, 50);
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_millis(10));
        assert_eq!(limiter.max_permits(), 1);
    }
}
