//! Token-bucket throughput limiting.
//!
//! One limiter instance caps outbound bytes across every connection
//! writer; another caps the scanner's hash throughput. Callers debit
//! the bucket before doing the work; a debit may push the balance
//! negative, in which case the caller sleeps until the deficit is
//! refilled. This keeps a single oversized debit (a full block) from
//! stalling forever behind a small burst ceiling.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant, sleep};

pub struct Limiter {
    rate: f64,
    burst: f64,
    state: Mutex<State>,
}

struct State {
    available: f64,
    last: Instant,
}

impl Limiter {
    /// `rate` in bytes per second with an explicit burst ceiling.
    pub fn new(rate: u64, burst: u64) -> Self {
        Limiter {
            rate: rate as f64,
            burst: burst as f64,
            state: Mutex::new(State {
                available: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Limiter from a KiB/s config knob, burst fixed at five times the
    /// rate. Zero means unlimited.
    pub fn from_kbps(kbps: u32) -> Option<Arc<Limiter>> {
        if kbps == 0 {
            return None;
        }
        let rate = kbps as u64 * 1024;
        Some(Arc::new(Limiter::new(rate, rate * 5)))
    }

    /// Debit `n` bytes, sleeping off any deficit.
    pub async fn consume(&self, n: usize) {
        let deficit = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let elapsed = now.duration_since(state.last).as_secs_f64();
            state.last = now;
            state.available = (state.available + elapsed * self.rate).min(self.burst);
            state.available -= n as f64;
            -state.available
        };
        if deficit > 0.0 {
            sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_is_free_then_paced() {
        let limiter = Limiter::new(1_000, 5_000);
        let start = Instant::now();

        // The burst allowance goes through without waiting.
        limiter.consume(5_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));

        // The next kilobyte has to wait out the deficit.
        limiter.consume(1_000).await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_caps_at_burst() {
        let limiter = Limiter::new(1_000, 2_000);
        limiter.consume(2_000).await;
        tokio::time::advance(Duration::from_secs(60)).await;

        // A minute of idle refills at most one burst worth.
        let start = Instant::now();
        limiter.consume(2_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
        limiter.consume(1_000).await;
        assert!(start.elapsed() >= Duration::from_millis(990));
    }

    #[test]
    fn zero_rate_means_unlimited() {
        assert!(Limiter::from_kbps(0).is_none());
        assert!(Limiter::from_kbps(100).is_some());
    }
}
