//! Reconnection backoff bookkeeping.
//!
//! A direct generalization of the Lazy Pirate retry pattern (zguide ch. 4):
//! track consecutive failed attempts, back off exponentially up to a cap,
//! and give the caller an explicit signal to stop trying. The orchestration
//! loop itself (actually dialing the transport, sleeping between attempts,
//! emitting lifecycle events) lives in `ConnectionCore`; this module only
//! owns the delay/attempt-counter state so it can be unit tested without a
//! socket.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use starling_config::ReconnectConfig;

use crate::frame::now_ms;

/// Outcome of a single connection attempt, as reported back to the
/// controller.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Success,
    Timeout,
    TransportError(String),
    /// The caller gave up before the attempt's own outcome was known
    /// (e.g. `disconnect()` was called mid-attempt).
    Aborted,
}

/// How many attempt durations `record_success` keeps for the running
/// average; the oldest is dropped once this is exceeded.
const MAX_TRACKED_DURATIONS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct ReconnectMetrics {
    pub attempt: u32,
    pub current_delay_ms: u64,
    pub total_attempts: u32,
    pub successful_reconnections: u32,
    pub failed_attempts: u32,
    pub last_attempt: Option<u64>,
    pub last_success: Option<u64>,
    pub last_reset: Option<u64>,
    pub attempt_durations_ms: Vec<u64>,
}

impl ReconnectMetrics {
    /// Mean of the last `attempt_durations_ms` (at most the last 10
    /// successful attempts), or `None` if no attempt has ever succeeded.
    pub fn average_attempt_duration_ms(&self) -> Option<f64> {
        if self.attempt_durations_ms.is_empty() {
            return None;
        }
        let sum: u64 = self.attempt_durations_ms.iter().sum();
        Some(sum as f64 / self.attempt_durations_ms.len() as f64)
    }
}

/// Tracks reconnection attempt count and current backoff delay.
///
/// Owned exclusively by `ConnectionCore`'s reconnect loop.
pub struct ReconnectionController {
    config: ReconnectConfig,
    attempt: AtomicU32,
    current_delay_ms: AtomicU64,
    total_attempts: AtomicU32,
    successful_reconnections: AtomicU32,
    failed_attempts: AtomicU32,
    last_attempt: Mutex<Option<u64>>,
    last_success: Mutex<Option<u64>>,
    last_reset: Mutex<Option<u64>>,
    attempt_durations_ms: Mutex<Vec<u64>>,
}

impl ReconnectionController {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: AtomicU32::new(0),
            current_delay_ms: AtomicU64::new(0),
            total_attempts: AtomicU32::new(0),
            successful_reconnections: AtomicU32::new(0),
            failed_attempts: AtomicU32::new(0),
            last_attempt: Mutex::new(None),
            last_success: Mutex::new(None),
            last_reset: Mutex::new(None),
            attempt_durations_ms: Mutex::new(Vec::with_capacity(MAX_TRACKED_DURATIONS)),
        }
    }

    /// Increment and return the attempt number about to be made (1-based).
    /// Also bumps `totalAttempts` and stamps `lastAttempt`.
    pub fn begin_attempt(&self) -> u32 {
        self.total_attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_attempt.lock().expect("reconnect mutex poisoned") = Some(now_ms());
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a successful reconnect: pushes the attempt's duration into the
    /// bounded history (dropping the oldest past `MAX_TRACKED_DURATIONS`),
    /// bumps `successfulReconnections`, and stamps `lastSuccess`.
    pub fn record_success(&self, duration_ms: u64) {
        self.successful_reconnections.fetch_add(1, Ordering::SeqCst);
        *self.last_success.lock().expect("reconnect mutex poisoned") = Some(now_ms());
        let mut durations = self.attempt_durations_ms.lock().expect("reconnect mutex poisoned");
        durations.push(duration_ms);
        if durations.len() > MAX_TRACKED_DURATIONS {
            durations.remove(0);
        }
    }

    /// Record a failed attempt: bumps `failedAttempts`.
    pub fn record_failure(&self) {
        self.failed_attempts.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether `attempt` exceeds the configured ceiling (`None` = unbounded).
    pub fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.config.max_attempts, Some(max) if attempt > max)
    }

    /// The delay to wait before the next attempt: the current delay
    /// multiplied by the backoff multiplier, capped at `max_delay_ms`, then
    /// stored as the new current delay. The very first call seeds from
    /// `min_delay_ms` before multiplying, so the first wait is already
    /// `min_delay_ms * backoff_multiplier` rather than a bare `min_delay_ms`.
    pub fn next_delay_ms(&self) -> u64 {
        let current = self.current_delay_ms.load(Ordering::SeqCst);
        let base = if current == 0 {
            self.config.min_delay_ms
        } else {
            current
        };
        let multiplied = (base as f64) * self.config.backoff_multiplier;
        let capped = multiplied.min(self.config.max_delay_ms as f64) as u64;
        self.current_delay_ms.store(capped, Ordering::SeqCst);
        capped
    }

    /// Reset attempt count and backoff delay back to their initial state,
    /// called once a connection has stayed up for `reset_threshold_ms`.
    /// Per spec, `reset()` reinitializes the metrics too; `lastReset` is
    /// stamped, not cleared, since it records when the reset happened.
    pub fn reset(&self) {
        self.attempt.store(0, Ordering::SeqCst);
        self.current_delay_ms.store(0, Ordering::SeqCst);
        self.total_attempts.store(0, Ordering::SeqCst);
        self.successful_reconnections.store(0, Ordering::SeqCst);
        self.failed_attempts.store(0, Ordering::SeqCst);
        *self.last_attempt.lock().expect("reconnect mutex poisoned") = None;
        *self.last_success.lock().expect("reconnect mutex poisoned") = None;
        self.attempt_durations_ms.lock().expect("reconnect mutex poisoned").clear();
        *self.last_reset.lock().expect("reconnect mutex poisoned") = Some(now_ms());
    }

    pub fn reset_threshold_ms(&self) -> u64 {
        self.config.reset_threshold_ms
    }

    pub fn metrics(&self) -> ReconnectMetrics {
        ReconnectMetrics {
            attempt: self.attempt.load(Ordering::SeqCst),
            current_delay_ms: self.current_delay_ms.load(Ordering::SeqCst),
            total_attempts: self.total_attempts.load(Ordering::SeqCst),
            successful_reconnections: self.successful_reconnections.load(Ordering::SeqCst),
            failed_attempts: self.failed_attempts.load(Ordering::SeqCst),
            last_attempt: *self.last_attempt.lock().expect("reconnect mutex poisoned"),
            last_success: *self.last_success.lock().expect("reconnect mutex poisoned"),
            last_reset: *self.last_reset.lock().expect("reconnect mutex poisoned"),
            attempt_durations_ms: self.attempt_durations_ms.lock().expect("reconnect mutex poisoned").clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            min_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_attempts: Some(3),
            reset_threshold_ms: 5_000,
        }
    }

    #[test]
    fn first_delay_is_min_times_multiplier() {
        let controller = ReconnectionController::new(config());
        assert_eq!(controller.next_delay_ms(), 200);
    }

    #[test]
    fn delay_grows_and_caps() {
        let controller = ReconnectionController::new(config());
        assert_eq!(controller.next_delay_ms(), 200);
        assert_eq!(controller.next_delay_ms(), 400);
        assert_eq!(controller.next_delay_ms(), 800);
        assert_eq!(controller.next_delay_ms(), 1_000); // capped
        assert_eq!(controller.next_delay_ms(), 1_000);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let controller = ReconnectionController::new(config());
        assert_eq!(controller.begin_attempt(), 1);
        assert!(!controller.exhausted(1));
        assert_eq!(controller.begin_attempt(), 2);
        assert_eq!(controller.begin_attempt(), 3);
        assert!(!controller.exhausted(3));
        assert_eq!(controller.begin_attempt(), 4);
        assert!(controller.exhausted(4));
    }

    #[test]
    fn unbounded_attempts_never_exhaust() {
        let mut c = config();
        c.max_attempts = None;
        let controller = ReconnectionController::new(c);
        for _ in 0..1000 {
            controller.begin_attempt();
        }
        assert!(!controller.exhausted(1000));
    }

    #[test]
    fn reset_restores_initial_state() {
        let controller = ReconnectionController::new(config());
        controller.begin_attempt();
        controller.next_delay_ms();
        controller.reset();
        let metrics = controller.metrics();
        assert_eq!(metrics.attempt, 0);
        assert_eq!(metrics.current_delay_ms, 0);
        assert_eq!(controller.next_delay_ms(), 200);
    }
}
