//! Inline wall-clock budget for a single integration call.
//!
//! The check is a synchronous elapsed-time comparison performed inside the
//! solver's step loop. No timer thread and no async cancellation token: a
//! cross-thread signal was measured (in the system this engine derives from)
//! to cost tens of milliseconds per call, while the inline check is near
//! free. On overrun the solver returns the same failure type it uses for
//! numerical breakdowns, so the overrun can never escape the evaluation
//! function as a foreign error type.

use std::time::{Duration, Instant};

/// A started wall-clock budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// Start a budget of `timeout_ms` milliseconds. A zero budget disables
    /// the deadline.
    pub fn start(timeout_ms: u64) -> Self {
        Self {
            started: Instant::now(),
            budget: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
        }
    }

    /// A deadline that never expires.
    pub fn unlimited() -> Self {
        Self {
            started: Instant::now(),
            budget: None,
        }
    }

    /// Has the budget been spent?
    #[inline]
    pub fn expired(&self) -> bool {
        match self.budget {
            Some(budget) => self.started.elapsed() >= budget,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_expires() {
        let deadline = Deadline::unlimited();
        assert!(!deadline.expired());
    }

    #[test]
    fn zero_budget_disables_the_deadline() {
        let deadline = Deadline::start(0);
        assert!(!deadline.expired());
    }

    #[test]
    fn tiny_budget_expires() {
        let deadline = Deadline::start(1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(deadline.expired());
    }
}
