use std::sync::Arc;

use crate::error::EngineError;

/// Predicate deciding whether a particular failure is worth retrying.
pub type RetryHandler = Arc<dyn Fn(&EngineError) -> bool + Send + Sync>;

/// Immutable backoff policy for `call_activity_with_retry` /
/// `call_sub_orchestrator_with_retry`.
///
/// `max_attempts` counts total calls, including the first. Delays grow as
/// `first_retry_interval_ms * backoff_coefficient^attempt`, clamped to
/// `max_retry_interval_ms`; `retry_timeout_ms` bounds the whole retry window
/// measured in virtual time from the first attempt.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub first_retry_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub max_retry_interval_ms: u64,
    pub retry_timeout_ms: Option<u64>,
    handle: Option<RetryHandler>,
}

impl RetryPolicy {
    pub fn new(first_retry_interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            first_retry_interval_ms,
            backoff_coefficient: 1.0,
            max_retry_interval_ms: 6 * 60 * 60 * 1000,
            retry_timeout_ms: None,
            handle: None,
        }
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_retry_interval_ms(mut self, max_interval_ms: u64) -> Self {
        self.max_retry_interval_ms = max_interval_ms;
        self
    }

    pub fn with_retry_timeout_ms(mut self, retry_timeout_ms: u64) -> Self {
        self.retry_timeout_ms = Some(retry_timeout_ms);
        self
    }

    /// Restrict retries to failures matching `predicate`.
    pub fn with_handle(mut self, predicate: impl Fn(&EngineError) -> bool + Send + Sync + 'static) -> Self {
        self.handle = Some(Arc::new(predicate));
        self
    }

    /// Compute the delay before the next attempt, or `None` to give up.
    ///
    /// `attempt` is the 1-based number of the attempt that just failed;
    /// `first_attempt_ms` and `now_ms` are virtual times. With
    /// `use_delays` false every granted retry is immediate.
    pub fn next_delay_ms(
        &self,
        attempt: u32,
        first_attempt_ms: u64,
        now_ms: u64,
        failure: &EngineError,
        use_delays: bool,
    ) -> Option<u64> {
        if attempt >= self.max_attempts {
            return None;
        }
        if let Some(handle) = &self.handle {
            if !handle(failure) {
                return None;
            }
        }
        if let Some(window) = self.retry_timeout_ms {
            if now_ms >= first_attempt_ms.saturating_add(window) {
                return None;
            }
        }
        if !use_delays {
            return Some(0);
        }
        let raw = self.first_retry_interval_ms as f64 * self.backoff_coefficient.powi(attempt as i32);
        let clamped = raw.min(self.max_retry_interval_ms as f64);
        Some(clamped as u64)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("first_retry_interval_ms", &self.first_retry_interval_ms)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("max_retry_interval_ms", &self.max_retry_interval_ms)
            .field("retry_timeout_ms", &self.retry_timeout_ms)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}
