//! Sliding-window event log.
//!
//! An event at `t` counts against the window at `now` iff `t > now - window`,
//! so a slot frees exactly `window` after the event that used it.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Window state after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub allowed: bool,
    /// Events in the window after this check.
    pub count: u32,
    /// When the oldest counted event leaves the window.
    pub reset_at: DateTime<Utc>,
}

impl WindowState {
    pub fn remaining(&self, cap: u32) -> u32 {
        cap.saturating_sub(self.count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlidingWindow {
    events: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    fn state(&self, allowed: bool, now: DateTime<Utc>, window: Duration) -> WindowState {
        WindowState {
            allowed,
            count: self.events.len() as u32,
            reset_at: self.events.front().map_or(now, |t| *t) + window,
        }
    }

    /// Record an event if fewer than `cap` are in the window. Rejected
    /// attempts are not recorded.
    pub fn try_consume(&mut self, now: DateTime<Utc>, window: Duration, cap: u32) -> WindowState {
        self.prune(now, window);
        let allowed = (self.events.len() as u32) < cap;
        if allowed {
            self.events.push_back(now);
        }
        self.state(allowed, now, window)
    }

    /// Current usage without consuming.
    pub fn peek(&mut self, now: DateTime<Utc>, window: Duration, cap: u32) -> WindowState {
        self.prune(now, window);
        let allowed = (self.events.len() as u32) < cap;
        self.state(allowed, now, window)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
