use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures inside the window required to trip.
    pub threshold: u32,
    /// Sliding window; failures age out of it, which is also how the
    /// breaker auto-resets.
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::seconds(60),
        }
    }
}

/// Process-local circuit breaker. Unexpected downstream failures feed it;
/// any success clears it; the manual pause flag overrides everything.
/// Cross-instance coordination is deliberately out of scope; each instance
/// protects itself.
pub struct CircuitBreaker {
    config: BreakerConfig,
    paused: AtomicBool,
    failures: Mutex<VecDeque<DateTime<Utc>>>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            paused: AtomicBool::new(false),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_failure(&self, at: DateTime<Utc>) {
        let Ok(mut failures) = self.failures.lock() else {
            return;
        };
        failures.push_back(at);
        Self::prune(&mut failures, at - self.config.window);
        if failures.len() as u32 >= self.config.threshold {
            warn!(
                failures = failures.len(),
                threshold = self.config.threshold,
                "circuit breaker tripped"
            );
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    #[must_use]
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if self.paused.load(Ordering::Relaxed) {
            return true;
        }
        let Ok(mut failures) = self.failures.lock() else {
            // A poisoned lock means a panic mid-update; fail closed.
            return true;
        };
        Self::prune(&mut failures, now - self.config.window);
        failures.len() as u32 >= self.config.threshold
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn prune(failures: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        while failures.front().is_some_and(|stamp| *stamp < cutoff) {
            failures.pop_front();
        }
    }
}
