//! Token-pacing primitive used by the production loops.
//!
//! [`Limiter::take`] blocks until it is safe to proceed and paces at most
//! `rps` tokens per second on average. The first take after construction
//! returns immediately; the production loops compensate with one extra take
//! at the end of each phase so the first second's rate is not inflated.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Paces callers at a fixed number of tokens per second.
///
/// A fresh limiter is created at every phase boundary (each ramp-up second
/// and the full attack). The schedule is carried between takes so the
/// long-term average holds even when a caller shows up late.
#[derive(Debug)]
pub struct Limiter {
    interval: Duration,
    next: Option<Instant>,
}

impl Limiter {
    /// Create a limiter pacing `rps` takes per second. `rps` must be > 0,
    /// which configuration validation guarantees before any limiter exists.
    pub fn new(rps: u64) -> Self {
        Self {
            interval: Duration::from_secs(1) / rps.max(1) as u32,
            next: None,
        }
    }

    /// Block until the next token slot. The first call returns immediately.
    pub async fn take(&mut self) {
        match self.next {
            None => {
                self.next = Some(Instant::now() + self.interval);
            }
            Some(at) => {
                sleep_until(at).await;
                self.next = Some(at + self.interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_take_is_immediate() {
        let mut limiter = Limiter::new(1);
        let start = Instant::now();
        limiter.take().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn paces_at_requested_rate() {
        let mut limiter = Limiter::new(100);
        let start = Instant::now();
        for _ in 0..51 {
            limiter.take().await;
        }
        // 50 paced intervals at 10ms each; the first take is free.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(480), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "too slow: {elapsed:?}");
    }

    #[tokio::test]
    async fn schedule_carries_over_missed_slots() {
        let mut limiter = Limiter::new(20);
        limiter.take().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // A late caller consumes the slots it missed without waiting, which
        // preserves the long-term average.
        let start = Instant::now();
        limiter.take().await;
        limiter.take().await;
        assert!(start.elapsed() < Duration::from_millis(60));
    }
}
