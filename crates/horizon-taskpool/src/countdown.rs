//! Countdown timeout budgets.
//!
//! A [`Countdown`] captures a monotonic start instant and an optional
//! deadline, and hands out the remaining slice of the budget on demand.
//! Public calls that perform several blocking waits under one timeout (the
//! map family, [`collect`](crate::future::collect), worker joins) create a
//! single countdown up front and feed every sub-wait from it, so the budget
//! covers the whole call rather than each wait individually.

use std::time::{Duration, Instant};

/// A monotonic timeout budget that emits a remaining slice per call.
///
/// A countdown built from `None` never expires and always reports an
/// unlimited remainder.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use horizon_taskpool::Countdown;
///
/// let countdown = Countdown::new(Some(Duration::from_secs(5)));
/// let remaining = countdown.remaining().unwrap();
/// assert!(remaining <= Duration::from_secs(5));
///
/// let unlimited = Countdown::new(None);
/// assert!(unlimited.remaining().is_none());
/// assert!(!unlimited.expired());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Countdown {
    timeout: Option<Duration>,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl Countdown {
    /// Start a countdown over `timeout`. `None` means no deadline.
    pub fn new(timeout: Option<Duration>) -> Self {
        let started_at = Instant::now();
        Self {
            timeout,
            started_at,
            deadline: timeout.map(|t| started_at + t),
        }
    }

    /// The original timeout the countdown was built from.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The instant the countdown started.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The instant the budget expires, or `None` for an unlimited budget.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The remaining budget, clamped at zero. `None` means unlimited.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the budget has run out.
    pub fn expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}
