//! Recovery-token bookkeeping for session resumption.
//!
//! The server hands back an opaque recovery token on connect; presenting it
//! on a later `?recover=<token>` reconnect lets the server restore session
//! state instead of starting fresh. This module owns the token and the
//! refresh-throttling policy; the actual `starling:state` RPC round trip is
//! driven by `ConnectionCore`, which has the request-issuing machinery this
//! module deliberately doesn't need to know about.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use starling_config::StateConfig;

use crate::error::StateError;
use crate::frame::now_ms;

/// The RPC method name a Helios-Starling server exposes for state refresh.
pub const REFRESH_METHOD: &str = "starling:state";

/// An opaque session-recovery token. Treated as an unstructured string;
/// the protocol does not define its internal shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryToken(pub String);

impl RecoveryToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Snapshot of the observable metrics surface described in spec.md §3:
/// refresh counters plus reconnect-driven downtime tracking.
#[derive(Debug, Clone, Default)]
pub struct StateMetrics {
    pub refreshes: u32,
    pub refresh_failures: u32,
    pub reconnections: u32,
    pub total_downtime_ms: u64,
    pub last_disconnect: Option<u64>,
}

/// Owns the current recovery token and the throttling policy around
/// refreshing it.
///
/// Owned exclusively by `ConnectionCore`'s reactor task.
pub struct StateManager {
    config: StateConfig,
    token: Mutex<Option<RecoveryToken>>,
    last_refresh: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
    refreshes: AtomicU32,
    refresh_failures: AtomicU32,
    reconnections: AtomicU32,
    total_downtime_ms: AtomicU64,
    last_disconnect_ms: Mutex<Option<u64>>,
}

impl StateManager {
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            token: Mutex::new(None),
            last_refresh: Mutex::new(None),
            refreshing: AtomicBool::new(false),
            refreshes: AtomicU32::new(0),
            refresh_failures: AtomicU32::new(0),
            reconnections: AtomicU32::new(0),
            total_downtime_ms: AtomicU64::new(0),
            last_disconnect_ms: Mutex::new(None),
        }
    }

    /// Record that the connection just dropped, per spec.md §4.8's
    /// `starling:disconnected` binding. Stamps `lastDisconnect` so the next
    /// `note_reconnected` can accumulate downtime.
    pub fn note_disconnected(&self) {
        *self.last_disconnect_ms.lock().expect("state manager mutex poisoned") = Some(now_ms());
    }

    /// Record a successful (re)connect, per spec.md §4.8's
    /// `starling:connected` binding: if a disconnect was pending, bump
    /// `reconnections` and fold the downtime into `totalDowntime`. A no-op
    /// on the very first connect, when no disconnect has been observed yet.
    pub fn note_reconnected(&self) {
        let mut last_disconnect = self.last_disconnect_ms.lock().expect("state manager mutex poisoned");
        if let Some(disconnected_at) = last_disconnect.take() {
            self.reconnections.fetch_add(1, Ordering::SeqCst);
            self.total_downtime_ms
                .fetch_add(now_ms().saturating_sub(disconnected_at), Ordering::SeqCst);
        }
    }

    pub fn note_refresh_success(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn note_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> StateMetrics {
        StateMetrics {
            refreshes: self.refreshes.load(Ordering::SeqCst),
            refresh_failures: self.refresh_failures.load(Ordering::SeqCst),
            reconnections: self.reconnections.load(Ordering::SeqCst),
            total_downtime_ms: self.total_downtime_ms.load(Ordering::SeqCst),
            last_disconnect: *self.last_disconnect_ms.lock().expect("state manager mutex poisoned"),
        }
    }

    pub fn token(&self) -> Option<RecoveryToken> {
        self.token.lock().expect("state manager mutex poisoned").clone()
    }

    pub fn set_token(&self, token: RecoveryToken) {
        *self.token.lock().expect("state manager mutex poisoned") = Some(token);
        *self
            .last_refresh
            .lock()
            .expect("state manager mutex poisoned") = Some(Instant::now());
    }

    pub fn clear_token(&self) {
        *self.token.lock().expect("state manager mutex poisoned") = None;
    }

    /// Checks whether a refresh may proceed right now, without starting
    /// one. Callers should follow a successful check with `begin_refresh`.
    pub fn check_refresh_allowed(&self, force: bool) -> Result<(), StateError> {
        if self.refreshing.load(Ordering::SeqCst) {
            return Err(StateError::RefreshInProgress);
        }
        if !force {
            let last = *self.last_refresh.lock().expect("state manager mutex poisoned");
            if let Some(last) = last {
                if last.elapsed() < Duration::from_millis(self.config.min_refresh_interval_ms) {
                    return Err(StateError::TooSoon);
                }
            }
        }
        Ok(())
    }

    /// Claim the in-progress flag. Returns `false` if a refresh is already
    /// running.
    pub fn begin_refresh(&self) -> bool {
        !self.refreshing.swap(true, Ordering::SeqCst)
    }

    pub fn end_refresh(&self) {
        self.refreshing.store(false, Ordering::SeqCst);
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.config.refresh_interval_ms)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.config.retry_attempts
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.retry_delay_ms)
    }

    pub fn force_refresh_on_reconnect(&self) -> bool {
        self.config.force_refresh_on_reconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StateConfig {
        StateConfig {
            refresh_interval_ms: 300_000,
            min_refresh_interval_ms: 60_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            force_refresh_on_reconnect: true,
        }
    }

    #[test]
    fn first_refresh_is_always_allowed() {
        let manager = StateManager::new(config());
        assert!(manager.check_refresh_allowed(false).is_ok());
    }

    #[test]
    fn refresh_too_soon_after_last_is_rejected() {
        let manager = StateManager::new(config());
        manager.set_token(RecoveryToken("abc".to_string()));
        assert!(matches!(
            manager.check_refresh_allowed(false),
            Err(StateError::TooSoon)
        ));
    }

    #[test]
    fn forced_refresh_bypasses_throttle() {
        let manager = StateManager::new(config());
        manager.set_token(RecoveryToken("abc".to_string()));
        assert!(manager.check_refresh_allowed(true).is_ok());
    }

    #[test]
    fn concurrent_refresh_is_rejected() {
        let manager = StateManager::new(config());
        assert!(manager.begin_refresh());
        assert!(matches!(
            manager.check_refresh_allowed(true),
            Err(StateError::RefreshInProgress)
        ));
        manager.end_refresh();
        assert!(manager.check_refresh_allowed(true).is_ok());
    }

    #[test]
    fn token_round_trips() {
        let manager = StateManager::new(config());
        assert!(manager.token().is_none());
        manager.set_token(RecoveryToken("xyz".to_string()));
        assert_eq!(manager.token().unwrap().as_str(), "xyz");
        manager.clear_token();
        assert!(manager.token().is_none());
    }

    #[test]
    fn reconnect_after_disconnect_accumulates_downtime_and_count() {
        let manager = StateManager::new(config());
        manager.note_disconnected();
        std::thread::sleep(Duration::from_millis(5));
        manager.note_reconnected();

        let metrics = manager.metrics();
        assert_eq!(metrics.reconnections, 1);
        assert!(metrics.total_downtime_ms >= 5);
        assert!(metrics.last_disconnect.is_none());
    }

    #[test]
    fn reconnect_without_a_prior_disconnect_is_a_no_op() {
        let manager = StateManager::new(config());
        manager.note_reconnected();
        let metrics = manager.metrics();
        assert_eq!(metrics.reconnections, 0);
        assert_eq!(metrics.total_downtime_ms, 0);
    }

    #[test]
    fn refresh_counters_track_success_and_failure() {
        let manager = StateManager::new(config());
        manager.note_refresh_success();
        manager.note_refresh_success();
        manager.note_refresh_failure();
        let metrics = manager.metrics();
        assert_eq!(metrics.refreshes, 2);
        assert_eq!(metrics.refresh_failures, 1);
    }
}
