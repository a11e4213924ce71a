//! Circuit breaker over exchange calls.
//!
//! Failures are timestamped into a sliding window; crossing the per-minute
//! threshold opens the breaker. While open, the execution worker admits
//! only protective intents. The breaker closes itself after the auto-reset
//! interval; the next failure is evaluated against a fresh window.

use std::collections::VecDeque;

#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    window_ms: i64,
    threshold: usize,
    auto_reset_ms: i64,

    /// Timestamps of recent failures, oldest first.
    window: VecDeque<i64>,
    open: bool,
    opened_at_ms: i64,

    // Cumulative counters (never reset)
    pub total_failures: u64,
    pub total_successes: u64,
    pub consecutive_failures: u32,
    pub times_opened: u32,
    pub last_failure_ms: i64,
}

impl CircuitBreaker {
    pub fn new(threshold: usize, window_ms: i64, auto_reset_ms: i64) -> Self {
        Self {
            window_ms,
            threshold,
            auto_reset_ms,
            window: VecDeque::with_capacity(threshold + 4),
            open: false,
            opened_at_ms: 0,
            total_failures: 0,
            total_successes: 0,
            consecutive_failures: 0,
            times_opened: 0,
            last_failure_ms: 0,
        }
    }

    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while self.window.front().is_some_and(|&ts| ts < cutoff) {
            self.window.pop_front();
        }
    }

    /// Record a failed exchange call. Returns true when this failure opened
    /// the breaker (caller emits CIRCUIT_BREAKER_ENTER).
    pub fn record_failure(&mut self, now_ms: i64) -> bool {
        self.window.push_back(now_ms);
        self.evict(now_ms);
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.last_failure_ms = now_ms;

        if !self.open && self.window.len() >= self.threshold {
            self.open = true;
            self.opened_at_ms = now_ms;
            self.times_opened += 1;
            return true;
        }
        false
    }

    /// Record a successful exchange call.
    pub fn record_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_failures = 0;
    }

    /// Whether the breaker is currently open. Auto-closes once the reset
    /// interval elapses; callers observing the open→closed edge emit
    /// CIRCUIT_BREAKER_EXIT.
    pub fn is_open(&mut self, now_ms: i64) -> bool {
        if self.open && now_ms - self.opened_at_ms > self.auto_reset_ms {
            self.open = false;
            self.window.clear();
        }
        self.open
    }

    pub fn failures_in_window(&self) -> usize {
        self.window.len()
    }

    pub fn opened_at_ms(&self) -> i64 {
        self.opened_at_ms
    }
}
