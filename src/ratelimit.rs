//! Per-session sliding-window rate limiting.
//!
//! Runs before every other check in the gateway. Only admitted messages
//! occupy the window. Sessions with nothing left in their window are pruned
//! every `PRUNE_EVERY` calls, so the table tracks active senders only.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::config::RateLimitConfig;

const PRUNE_EVERY: u64 = 256;

#[derive(Debug, Default)]
struct Windows {
    sessions: HashMap<String, VecDeque<DateTime<Utc>>>,
    calls: u64,
}

/// Sliding-window limiter keyed by sender session id.
#[derive(Debug)]
pub struct RateLimiter {
    max_messages: u32,
    window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(max_messages: u32, window: std::time::Duration) -> Self {
        Self {
            max_messages,
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::weeks(52 * 100)),
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.max_messages,
            std::time::Duration::from_secs(config.window_secs),
        )
    }

    pub fn max_messages(&self) -> u32 {
        self.max_messages
    }

    pub fn window_secs(&self) -> u64 {
        self.window.num_seconds().max(0) as u64
    }

    /// Admit one message for `session_id` now.
    pub fn allow(&self, session_id: &str) -> bool {
        self.allow_at(session_id, Utc::now())
    }

    /// Admit one message at an explicit instant.
    ///
    /// Check and record happen under one lock, so concurrent submissions from
    /// the same session cannot burst past the limit.
    pub fn allow_at(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.window;
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        windows.calls += 1;
        if windows.calls % PRUNE_EVERY == 0 {
            let before = windows.sessions.len();
            windows.sessions.retain(|_, window| {
                evict(window, cutoff);
                !window.is_empty()
            });
            let pruned = before - windows.sessions.len();
            if pruned > 0 {
                tracing::debug!(pruned, "pruned idle rate-limit sessions");
            }
        }

        let window = windows.sessions.entry(session_id.to_string()).or_default();
        evict(window, cutoff);

        if window.len() >= self.max_messages as usize {
            tracing::debug!(session_id, "rate limit reached");
            return false;
        }

        window.push_back(now);
        true
    }

    /// Time until the oldest admitted message leaves the window. `None` while
    /// the session still has room.
    pub fn retry_after_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Duration> {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.sessions.get(session_id)?;
        if window.len() < self.max_messages as usize {
            return None;
        }
        window
            .front()
            .map(|oldest| (*oldest + self.window - now).max(Duration::zero()))
    }
}

fn evict(window: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while window.front().is_some_and(|ts| *ts <= cutoff) {
        window.pop_front();
    }
}
