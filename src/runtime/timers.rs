//! Virtual clock and the two suspension primitives built on it: the
//! single-value `WaitToken` (external events) and `OrchestrationTimer`
//! (timers, retry delays, wait timeouts).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Current wall-clock time in epoch milliseconds; seeds each new instance's
/// virtual clock.
pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-instance logical time. Advances only via `timeshift`; timers sleep real
/// wall-clock time for the *remaining virtual delay* and are force-fired when
/// a shift makes them due.
#[derive(Debug)]
pub(crate) struct VirtualClock {
    now_ms: AtomicU64,
}

impl VirtualClock {
    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    /// Advance by `delta_ms` and return the new time.
    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

#[derive(Debug)]
enum TokenState {
    Pending,
    Settled(Value),
    Canceled,
}

/// Single-value settable, cancelable suspension primitive. One waiter at most;
/// `settle` and `cancel` may arrive from any task.
#[derive(Debug)]
pub(crate) struct WaitToken {
    state: Mutex<TokenState>,
    notify: Notify,
}

impl WaitToken {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TokenState::Pending),
            notify: Notify::new(),
        }
    }

    /// Settle with a value. Returns false if the token was already resolved.
    pub fn settle(&self, value: Value) -> bool {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, TokenState::Pending) {
            return false;
        }
        *state = TokenState::Settled(value);
        drop(state);
        self.notify.notify_one();
        true
    }

    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, TokenState::Pending) {
            *state = TokenState::Canceled;
        }
        drop(state);
        self.notify.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock().unwrap(), TokenState::Pending)
    }

    /// Wait for resolution: `Some(value)` when settled, `None` when canceled.
    pub async fn wait(&self) -> Option<Value> {
        loop {
            {
                let state = self.state.lock().unwrap();
                match &*state {
                    TokenState::Settled(value) => return Some(value.clone()),
                    TokenState::Canceled => return None,
                    TokenState::Pending => {}
                }
            }
            // notify_one leaves a permit, so a resolution racing this await is
            // not lost.
            self.notify.notified().await;
        }
    }
}

pub(crate) enum TimerOutcome {
    Fired,
    Canceled,
}

/// A timer scheduled against an instance's virtual clock. Sleeps real time for
/// the remaining virtual delay; a time-shift that reaches `fire_at_ms` forces
/// it to fire without the wall-clock wait. The caller's cancellation token is
/// kept distinct from force-firing so the two resolutions are distinguishable.
#[derive(Debug)]
pub(crate) struct OrchestrationTimer {
    pub fire_at_ms: u64,
    started_at_ms: u64,
    forced: AtomicBool,
    notify: Notify,
}

impl OrchestrationTimer {
    pub fn new(fire_at_ms: u64, started_at_ms: u64) -> Self {
        Self {
            fire_at_ms,
            started_at_ms,
            forced: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Called with the new virtual time after a shift; fires the timer when
    /// its due time has been reached.
    pub fn time_changed(&self, now_ms: u64) {
        if now_ms < self.fire_at_ms {
            return;
        }
        self.forced.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> TimerOutcome {
        if self.forced.load(Ordering::SeqCst) {
            return TimerOutcome::Fired;
        }
        let delay_ms = self.fire_at_ms.saturating_sub(self.started_at_ms);
        tokio::select! {
            biased;
            _ = self.notify.notified() => TimerOutcome::Fired,
            _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => TimerOutcome::Fired,
            _ = cancel.cancelled() => TimerOutcome::Canceled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_token_settles_with_value() {
        let token = Arc::new(WaitToken::new());
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait().await })
        };
        token.settle(json!("hello"));
        let got = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(json!("hello")));
    }

    #[tokio::test]
    async fn wait_token_settle_before_wait_is_not_lost() {
        let token = WaitToken::new();
        token.settle(json!(1));
        assert_eq!(token.wait().await, Some(json!(1)));
        // second resolution attempts are rejected
        assert!(!token.settle(json!(2)));
    }

    #[tokio::test]
    async fn wait_token_cancel_yields_none() {
        let token = WaitToken::new();
        token.cancel();
        assert_eq!(token.wait().await, None);
        assert!(!token.is_pending());
    }

    #[tokio::test]
    async fn timer_force_fire_skips_the_real_delay() {
        let timer = Arc::new(OrchestrationTimer::new(1_000_000, 0));
        timer.time_changed(1_000_000);
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(Duration::from_millis(200), timer.wait(&cancel))
            .await
            .expect("forced timer should fire immediately");
        assert!(matches!(outcome, TimerOutcome::Fired));
    }

    #[tokio::test]
    async fn timer_time_changed_before_due_does_not_fire() {
        let timer = OrchestrationTimer::new(500_000, 0);
        timer.time_changed(400_000);
        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(Duration::from_millis(50), timer.wait(&cancel)).await;
        assert!(result.is_err(), "timer should still be pending");
    }

    #[tokio::test]
    async fn timer_cancellation_is_distinguished_from_firing() {
        let timer = OrchestrationTimer::new(1_000_000, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = timer.wait(&cancel).await;
        assert!(matches!(outcome, TimerOutcome::Canceled));
    }

    #[test]
    fn clock_advances_by_delta() {
        let clock = VirtualClock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        assert_eq!(clock.advance(500), 1_500);
        assert_eq!(clock.now_ms(), 1_500);
    }
}
