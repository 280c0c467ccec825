//! Child-death throttle (spec.md §8 Scenario F).
//!
//! The fork() model keeps a sliding window of recent child deaths and
//! refuses to spawn replacements once ten have died within ten seconds,
//! logging and backing off instead of respawning into a crash loop. A
//! spawned tokio task standing in for a child, this tracks `JoinHandle`
//! failures (panics, or a worker returning early) the same way.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(10);
const LIMIT: usize = 10;

/// Tracks recent worker-task deaths for one stage pool and decides
/// whether spawning a replacement should be throttled.
pub struct DeathThrottle {
    deaths: VecDeque<Instant>,
}

impl DeathThrottle {
    pub fn new() -> Self {
        Self {
            deaths: VecDeque::new(),
        }
    }

    /// Records a death at `now` and evicts entries older than the window.
    pub fn record(&mut self, now: Instant) {
        self.deaths.push_back(now);
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.deaths.front() {
            if now.saturating_duration_since(*front) > WINDOW {
                self.deaths.pop_front();
            } else {
                break;
            }
        }
    }

    /// True once `LIMIT` deaths have landed inside the trailing `WINDOW`.
    pub fn is_tripped(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.deaths.len() >= LIMIT
    }
}

impl Default for DeathThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn trips_after_ten_deaths_within_ten_seconds() {
        let mut throttle = DeathThrottle::new();
        for _ in 0..9 {
            throttle.record(Instant::now());
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        assert!(!throttle.is_tripped(Instant::now()));
        throttle.record(Instant::now());
        assert!(throttle.is_tripped(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn deaths_outside_the_window_are_forgotten() {
        let mut throttle = DeathThrottle::new();
        for _ in 0..10 {
            throttle.record(Instant::now());
        }
        assert!(throttle.is_tripped(Instant::now()));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!throttle.is_tripped(Instant::now()));
    }
}
