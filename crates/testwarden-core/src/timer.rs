//! Single-shot watchdog timer.
//!
//! A [`WatchdogTimer`] is armed once with a deadline and ends in exactly one
//! of two terminal states: cancelled (normal completion) or fired. It is
//! never re-armed. State transitions are compare-and-swap on an atomic, so
//! concurrent `cancel` and fire attempts resolve to a single winner.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

const ARMED: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerState {
    Armed,
    Cancelled,
    Fired,
}

impl std::fmt::Display for TimerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Armed => write!(f, "armed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Fired => write!(f, "fired"),
        }
    }
}

#[derive(Debug)]
pub struct WatchdogTimer {
    owner: String,
    deadline: Instant,
    state: AtomicU8,
    cancelled: Notify,
}

impl WatchdogTimer {
    /// Arm a timer that expires `timeout` from now.
    #[must_use]
    pub fn arm(owner: impl Into<String>, timeout: Duration) -> Self {
        Self {
            owner: owner.into(),
            deadline: Instant::now() + timeout,
            state: AtomicU8::new(ARMED),
            cancelled: Notify::new(),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    #[must_use]
    pub fn state(&self) -> TimerState {
        match self.state.load(Ordering::Acquire) {
            ARMED => TimerState::Armed,
            CANCELLED => TimerState::Cancelled,
            _ => TimerState::Fired,
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(ARMED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancel an armed timer. Returns `false` if it already fired or was
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let won = self.transition(CANCELLED);
        if won {
            self.cancelled.notify_waiters();
        }
        won
    }

    /// Fire now if still armed. Returns `true` only for the call that fired.
    pub fn fire(&self) -> bool {
        self.transition(FIRED)
    }

    /// Fire if `now` has reached the deadline. Returns `true` at most once.
    pub fn poll(&self, now: Instant) -> bool {
        now >= self.deadline && self.fire()
    }

    /// Wait for the deadline or cancellation.
    ///
    /// Returns `true` only for the waiter whose wake-up fired the timer.
    pub async fn wait(&self) -> bool {
        let notified = self.cancelled.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.state() != TimerState::Armed {
            return false;
        }

        tokio::select! {
            () = tokio::time::sleep_until(self.deadline) => self.fire(),
            () = &mut notified => false,
        }
    }
}
