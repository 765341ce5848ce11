//! Active call accounting and the idle timer.
//!
//! Count, timer and quit flag live in one state value behind a `watch`
//! channel, so every transition (call start, call end, expiry, quit) is a
//! single serialized update and the timer task sees each change.

use std::future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArmedTimer {
    deadline: Instant,
    generation: u64,
}

#[derive(Debug)]
struct IdleState {
    active: usize,
    timeout: Duration,
    quit_requested: bool,
    timer: Option<ArmedTimer>,
    generation: u64,
}

impl IdleState {
    fn arm(&mut self) {
        if self.timeout.is_zero() {
            self.timer = None;
            return;
        }
        self.generation += 1;
        self.timer = Some(ArmedTimer {
            deadline: Instant::now() + self.timeout,
            generation: self.generation,
        });
    }
}

/// Counts in-flight calls and decides when the daemon has been idle long
/// enough to exit.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: watch::Sender<IdleState>,
}

impl ConnectionTracker {
    /// A zero `timeout` disables idle expiry.
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(IdleState {
            active: 0,
            timeout,
            quit_requested: false,
            timer: None,
            generation: 0,
        });
        Self { state }
    }

    /// A call started: count it and disarm the timer.
    pub fn on_start(&self, info: &CallInfo) {
        self.state.send_modify(|s| {
            s.active += 1;
            s.timer = None;
            trace!(method = %info.method, active = s.active, "Call started");
        });
    }

    /// A call finished: the last one out arms the timer.
    pub fn on_done(&self, info: &CallInfo) {
        self.state.send_modify(|s| {
            match s.active.checked_sub(1) {
                Some(active) => s.active = active,
                None => {
                    warn!(method = %info.method, "Call ended without a matching start");
                    return;
                }
            }
            trace!(method = %info.method, active = s.active, "Call ended");
            if s.active == 0 && !s.quit_requested {
                s.arm();
            }
        });
    }

    /// Takes effect the next time the timer is armed.
    pub fn change_timeout(&self, timeout: Duration) {
        self.state.send_modify(|s| {
            debug!(from = ?s.timeout, to = ?timeout, "Idle timeout changed");
            s.timeout = timeout;
        });
    }

    pub fn timeout(&self) -> Duration {
        self.state.borrow().timeout
    }

    pub fn active(&self) -> usize {
        self.state.borrow().active
    }

    pub fn is_quitting(&self) -> bool {
        self.state.borrow().quit_requested
    }

    /// Arm the timer if nothing is running, as when the daemon starts listening.
    pub fn arm_if_idle(&self) {
        self.state.send_if_modified(|s| {
            if s.active == 0 && !s.quit_requested {
                s.arm();
                true
            } else {
                false
            }
        });
    }

    /// Mark the daemon as quitting and disarm the timer.
    ///
    /// Returns `false` if it was already quitting.
    pub fn request_quit(&self) -> bool {
        let mut first = false;
        self.state.send_if_modified(|s| {
            s.timer = None;
            first = !s.quit_requested;
            s.quit_requested = true;
            true
        });
        first
    }

    /// Resolves once the timer fires with no call in flight.
    ///
    /// Expiry is committed in the same update that checks the count, so a
    /// call starting concurrently either disarms the timer first or observes
    /// the daemon already quitting.
    pub async fn expired(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let timer = rx.borrow_and_update().timer;
            match timer {
                None => {
                    if rx.changed().await.is_err() {
                        future::pending::<()>().await;
                    }
                }
                Some(timer) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(timer.deadline) => {
                            if self.try_expire(timer.generation) {
                                return;
                            }
                        }
                        res = rx.changed() => {
                            if res.is_err() {
                                future::pending::<()>().await;
                            }
                        }
                    }
                }
            }
        }
    }

    fn try_expire(&self, generation: u64) -> bool {
        let mut fired = false;
        self.state.send_if_modified(|s| {
            let armed = s.timer.map(|t| t.generation) == Some(generation);
            if armed && s.active == 0 && !s.quit_requested {
                s.quit_requested = true;
                s.timer = None;
                fired = true;
            }
            fired
        });
        if fired {
            info!("Idle timeout reached, no active call");
        }
        fired
    }

    /// Resolves once no call is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|s| s.active == 0).await;
    }
}

/// Metadata of one RPC call, passed to the call hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub method: String,
}

impl CallInfo {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
        }
    }
}

/// Calls `on_done` when dropped, including when the call task is aborted.
pub struct CallGuard<'a> {
    tracker: &'a ConnectionTracker,
    info: CallInfo,
}

impl<'a> CallGuard<'a> {
    pub fn new(tracker: &'a ConnectionTracker, info: CallInfo) -> Self {
        tracker.on_start(&info);
        Self { tracker, info }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.tracker.on_done(&self.info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_expires_when_idle() {
        let tracker = ConnectionTracker::new(SHORT);
        tracker.arm_if_idle();

        tokio::time::timeout(Duration::from_secs(1), tracker.expired())
            .await
            .expect("timer should fire");
        assert!(tracker.is_quitting());
    }

    #[tokio::test]
    async fn test_active_call_prevents_expiry() {
        let tracker = ConnectionTracker::new(SHORT);
        tracker.arm_if_idle();
        tracker.on_start(&CallInfo::new("Status"));

        let res = tokio::time::timeout(Duration::from_millis(100), tracker.expired()).await;
        assert!(res.is_err(), "timer fired with a call in flight");
        assert!(!tracker.is_quitting());

        tracker.on_done(&CallInfo::new("Status"));
        tokio::time::timeout(Duration::from_secs(1), tracker.expired())
            .await
            .expect("timer should fire after the call ends");
    }

    #[tokio::test]
    async fn test_zero_timeout_never_expires() {
        let tracker = ConnectionTracker::new(Duration::ZERO);
        tracker.arm_if_idle();
        tracker.on_start(&CallInfo::new("Version"));
        tracker.on_done(&CallInfo::new("Version"));

        let res = tokio::time::timeout(Duration::from_millis(50), tracker.expired()).await;
        assert!(res.is_err());
        assert!(!tracker.is_quitting());
    }

    #[tokio::test]
    async fn test_no_rearm_after_quit() {
        let tracker = ConnectionTracker::new(SHORT);
        tracker.on_start(&CallInfo::new("Stop"));
        assert!(tracker.request_quit());
        assert!(!tracker.request_quit());
        tracker.on_done(&CallInfo::new("Stop"));

        let res = tokio::time::timeout(Duration::from_millis(50), tracker.expired()).await;
        assert!(res.is_err(), "quit already requested, nothing left to expire");
    }

    #[test]
    fn test_unbalanced_done_never_goes_negative() {
        let tracker = ConnectionTracker::new(SHORT);
        tracker.on_done(&CallInfo::new("Version"));
        assert_eq!(tracker.active(), 0);
        tracker.on_start(&CallInfo::new("Version"));
        assert_eq!(tracker.active(), 1);
    }

    #[test]
    fn test_change_timeout_applies_on_next_arm() {
        let tracker = ConnectionTracker::new(SHORT);
        tracker.change_timeout(Duration::from_millis(50));
        tracker.change_timeout(Duration::from_millis(70));
        assert_eq!(tracker.timeout(), Duration::from_millis(70));
    }

    #[tokio::test]
    async fn test_change_timeout_keeps_armed_deadline() {
        let tracker = ConnectionTracker::new(SHORT);
        tracker.arm_if_idle();
        tracker.change_timeout(Duration::from_millis(500));

        tokio::time::timeout(Duration::from_millis(100), tracker.expired())
            .await
            .expect("armed timer should keep its original deadline");
    }

    #[tokio::test]
    async fn test_change_timeout_used_by_next_arm() {
        let tracker = ConnectionTracker::new(SHORT);
        tracker.arm_if_idle();
        tracker.change_timeout(Duration::from_millis(500));
        tracker.on_start(&CallInfo::new("Status"));
        tracker.on_done(&CallInfo::new("Status"));

        let res = tokio::time::timeout(Duration::from_millis(100), tracker.expired()).await;
        assert!(res.is_err(), "re-armed timer should use the new timeout");
        assert!(!tracker.is_quitting());
    }

    #[test]
    fn test_guard_counts_call() {
        let tracker = ConnectionTracker::new(SHORT);
        {
            let _guard = CallGuard::new(&tracker, CallInfo::new("Status"));
            assert_eq!(tracker.active(), 1);
        }
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_lose_no_update() {
        let tracker = Arc::new(ConnectionTracker::new(Duration::ZERO));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let tracker = Arc::clone(&tracker);
            tasks.push(tokio::spawn(async move {
                for _ in 0..500 {
                    tracker.on_start(&CallInfo::new("Status"));
                    tokio::task::yield_now().await;
                    tracker.on_done(&CallInfo::new("Status"));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expiry_racing_new_call_stays_consistent() {
        for _ in 0..50 {
            let tracker = Arc::new(ConnectionTracker::new(Duration::from_millis(1)));
            tracker.arm_if_idle();

            let expiry = {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    tokio::time::timeout(Duration::from_millis(20), tracker.expired())
                        .await
                        .is_ok()
                })
            };
            tokio::time::sleep(Duration::from_millis(1)).await;
            tracker.on_start(&CallInfo::new("Status"));

            let fired = expiry.await.unwrap();
            // either the call disarmed the timer, or expiry won and the
            // daemon is quitting with that call still counted for the drain
            assert_eq!(fired, tracker.is_quitting());
            assert_eq!(tracker.active(), 1);
            tracker.on_done(&CallInfo::new("Status"));
        }
    }
}
