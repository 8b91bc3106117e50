//! Sliding-window rate limiting for relayed actions.
//!
//! Two windows run side by side (per-second and per-minute); an action must
//! fit in both. A rejected action consumes no slot in either window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tabpilot_core::RateLimitConfig;

#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    max: u32,
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            window,
            max,
            stamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.stamps.front() {
            if now.duration_since(oldest) >= self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn would_allow(&mut self, now: Instant) -> bool {
        self.prune(now);
        (self.stamps.len() as u32) < self.max
    }

    fn record(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

#[derive(Debug)]
pub struct ActionRateLimiter {
    per_second: SlidingWindow,
    per_minute: SlidingWindow,
}

impl ActionRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            per_second: SlidingWindow::new(Duration::from_secs(1), config.max_per_second),
            per_minute: SlidingWindow::new(Duration::from_secs(60), config.max_per_minute),
        }
    }

    /// Admit one action if both windows have room, recording it in both.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        if !self.per_second.would_allow(now) || !self.per_minute.would_allow(now) {
            return false;
        }
        self.per_second.record(now);
        self.per_minute.record(now);
        true
    }
}
