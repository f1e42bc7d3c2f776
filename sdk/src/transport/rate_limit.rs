//! Client-side sliding-window rate limiter.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Tracks send timestamps inside a sliding window. A request is rejected
/// before its frame is sent when the window is saturated.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    max:    usize,
    window: Duration,
    hits:   VecDeque<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: VecDeque::with_capacity(max),
        }
    }

    /// Records a send at `now` if the window allows one more.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.max {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}
