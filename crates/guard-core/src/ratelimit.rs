//! Fixed-window admission control keyed by arbitrary strings.
//!
//! Windows reset at discrete boundaries, so a caller may burst up to `2 * max` across a
//! boundary. State is process-local: every worker in the pool enforces its own limits.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Copy, Debug)]
struct WindowRecord {
    count: u32,
    reset_at: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    records: Mutex<HashMap<String, WindowRecord>>,
    sweeper: Mutex<Option<Sweeper>>,
}

struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one unit of work for `key`, allowing at most `max_requests` per `window`.
    pub fn allow(&self, key: &str, max_requests: u32, window: Duration) -> bool {
        self.allow_at(key, max_requests, window, Instant::now())
    }

    pub fn allow_at(&self, key: &str, max_requests: u32, window: Duration, now: Instant) -> bool {
        let mut records = self.records();

        match records.get_mut(key) {
            Some(record) if now < record.reset_at => {
                if record.count >= max_requests {
                    return false;
                }
                record.count += 1;
                true
            }
            _ => {
                records.insert(
                    key.to_string(),
                    WindowRecord {
                        count: 1,
                        reset_at: now + window,
                    },
                );
                true
            }
        }
    }

    /// Drop every record whose window has elapsed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, r| now < r.reset_at);
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic sweep. Calling this again while a sweeper runs is a no-op.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(
            Arc::downgrade(self),
            interval,
            cancel.clone(),
        ));
        *slot = Some(Sweeper { cancel, handle });
    }

    /// Stop the periodic sweep (tests, graceful shutdown).
    pub fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            sweeper.handle.abort();
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, WindowRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn sweep_loop(limiter: Weak<RateLimiter>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(limiter) = limiter.upgrade() else { break };
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, remaining = limiter.len(), "swept expired rate-limit windows");
                }
            }
        }
    }
}

/// Key used for per-user message persistence limits.
pub fn message_save_key(user_id: crate::domain::UserId) -> String {
    format!("message_save_{}", user_id.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_max_then_rejects_within_window() {
        let rl = RateLimiter::new();
        let start = Instant::now();
        let window = Duration::from_millis(1000);

        for i in 0..3 {
            let now = start + Duration::from_millis(i * 10);
            assert!(rl.allow_at("k", 3, window, now), "call {i} should pass");
        }
        assert!(!rl.allow_at("k", 3, window, start + Duration::from_millis(500)));
        // Rejection does not extend the window.
        assert!(!rl.allow_at("k", 3, window, start + Duration::from_millis(999)));
    }

    #[test]
    fn window_resets_after_elapsed() {
        let rl = RateLimiter::new();
        let start = Instant::now();
        let window = Duration::from_millis(1000);

        assert!(rl.allow_at("k", 1, window, start));
        assert!(!rl.allow_at("k", 1, window, start + Duration::from_millis(1)));
        assert!(rl.allow_at("k", 1, window, start + window));
        assert!(!rl.allow_at("k", 1, window, start + window + Duration::from_millis(1)));
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new();
        let now = Instant::now();
        let window = Duration::from_secs(60);

        assert!(rl.allow_at("message_save_1", 1, window, now));
        assert!(!rl.allow_at("message_save_1", 1, window, now));
        assert!(rl.allow_at("message_save_2", 1, window, now));
    }

    #[test]
    fn sweep_removes_only_expired_windows() {
        let rl = RateLimiter::new();
        let start = Instant::now();

        rl.allow_at("short", 5, Duration::from_millis(100), start);
        rl.allow_at("long", 5, Duration::from_secs(60), start);
        assert_eq!(rl.len(), 2);

        assert_eq!(rl.sweep_at(start + Duration::from_millis(50)), 0);
        assert_eq!(rl.sweep_at(start + Duration::from_millis(100)), 1);
        assert_eq!(rl.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_collects_expired_keys() {
        let rl = Arc::new(RateLimiter::new());
        rl.allow("a", 1, Duration::from_secs(1));
        rl.start_sweeper(Duration::from_secs(5));
        rl.start_sweeper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rl.is_empty());

        rl.shutdown();
        rl.allow("b", 1, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(rl.len(), 1);
    }

    #[test]
    fn message_save_key_format() {
        assert_eq!(message_save_key(crate::domain::UserId(42)), "message_save_42");
    }
}
