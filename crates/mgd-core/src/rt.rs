//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Primary dispatch loop and lifecycle management."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Async rate limiter that keeps the tick loop on a deterministic cadence.
///
/// Missed ticks are delayed rather than bursted so a long solve cannot cause
/// a pile-up of immediate wakeups.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_the_configured_period() {
        let mut limiter = RateLimiter::new(Duration::from_millis(42));
        let first = limiter.tick().await;
        let second = limiter.tick().await;
        let third = limiter.tick().await;
        assert_eq!(second.duration_since(first), Duration::from_millis(42));
        assert_eq!(third.duration_since(second), Duration::from_millis(42));
    }
}
