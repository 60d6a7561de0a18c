// Copyright (c) James Kassemi, SC, US. All rights reserved.
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Bounded exponential backoff: attempt `k` waits `base · backoff^k`,
/// capped at `max_delay_ms`, with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub backoff: f64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, backoff: f64, jitter_pct: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay_ms.max(1),
            backoff: backoff.max(1.0),
            max_delay_ms: 30_000,
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    pub fn default_network() -> Self {
        Self::new(3, 1_000, 2.0, 0.1)
    }

    /// Delay before re-attempting after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let scaled = self.base_delay_ms as f64 * self.backoff.powi(attempt as i32);
        let mut delay = scaled.min(self.max_delay_ms as f64) as u64;
        if self.jitter_pct > 0.0 {
            let spread = (delay as f64 * self.jitter_pct) as i64;
            if spread > 0 {
                let mut rng = rand::thread_rng();
                let delta = rng.gen_range(-spread..=spread);
                delay = delay.saturating_add_signed(delta);
            }
        }
        Duration::from_millis(delay)
    }

    pub async fn retry_async<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_network()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{advance, pause};

    #[test]
    fn new_clamps_input_parameters() {
        let policy = RetryPolicy::new(0, 0, 0.5, 2.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.backoff, 1.0);
        assert_eq!(policy.jitter_pct, 1.0);
    }

    #[test]
    fn delay_follows_backoff_ladder() {
        let policy = RetryPolicy::new(3, 1_000, 2.0, 0.0);
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
    }

    #[test]
    fn delay_caps_at_max() {
        let policy = RetryPolicy::new(10, 10_000, 3.0, 0.0);
        assert_eq!(policy.delay_for(5), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn retry_async_retries_until_success() {
        pause();
        let policy = RetryPolicy::new(3, 10, 1.0, 0.0);
        let attempts = Arc::new(AtomicUsize::new(0));
        let advancer = tokio::spawn(async {
            advance(Duration::from_millis(10)).await;
            advance(Duration::from_millis(10)).await;
        });

        let result: Result<&'static str, &str> = policy
            .retry_async(|attempt| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err("boom")
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        advancer.await.unwrap();
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_async_stops_after_max_attempts() {
        pause();
        let policy = RetryPolicy::new(2, 5, 1.0, 0.0);
        let attempts = Arc::new(AtomicUsize::new(0));
        let advancer = tokio::spawn(async { advance(Duration::from_millis(5)).await });

        let result: Result<(), &str> = policy
            .retry_async(|_| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("nope")
                }
            })
            .await;

        advancer.await.unwrap();
        assert_eq!(result, Err("nope"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
