//! Rolling one-hour limit on published announcements

use governor::clock::{Clock, DefaultClock, Reference};
use governor::nanos::Nanos;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// Length of the rolling window
pub const RATE_WINDOW: Duration = Duration::from_secs(3600);

/// Rolling one-hour limit on published posts.
///
/// Only successful posts are recorded, so a check never consumes budget.
/// Entries older than the window are evicted lazily on each check.
pub struct PostRateLimiter<C: Clock = DefaultClock> {
    clock: C,
    max_per_hour: usize,
    window: VecDeque<C::Instant>,
}

impl PostRateLimiter<DefaultClock> {
    pub fn new(max_per_hour: usize) -> Self {
        Self::with_clock(max_per_hour, DefaultClock::default())
    }
}

impl<C: Clock> PostRateLimiter<C> {
    pub fn with_clock(max_per_hour: usize, clock: C) -> Self {
        Self {
            clock,
            max_per_hour,
            window: VecDeque::with_capacity(max_per_hour),
        }
    }

    pub fn max_per_hour(&self) -> usize {
        self.max_per_hour
    }

    fn evict_expired(&mut self) {
        let now = self.clock.now();
        let window = Nanos::from(RATE_WINDOW);
        while let Some(oldest) = self.window.front() {
            if now.duration_since(*oldest) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether another post fits in the current window
    pub fn check(&mut self) -> bool {
        self.evict_expired();
        let allowed = self.window.len() < self.max_per_hour;
        if !allowed {
            debug!(
                recent_posts = self.window.len(),
                max_per_hour = self.max_per_hour,
                "Post rate limit reached"
            );
        }
        allowed
    }

    /// Record a post made now
    pub fn record(&mut self) {
        self.window.push_back(self.clock.now());
        while self.window.len() > self.max_per_hour {
            self.window.pop_front();
        }
    }

    /// Posts still allowed in the current window
    pub fn remaining(&mut self) -> usize {
        self.evict_expired();
        self.max_per_hour.saturating_sub(self.window.len())
    }

    /// Posts recorded in the current window
    pub fn recent(&mut self) -> usize {
        self.evict_expired();
        self.window.len()
    }
}
