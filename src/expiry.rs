use crate::session::Session;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Smallest distance into the future a timer is armed at.
///
/// Keeps a zero or near-zero timeout from re-firing in a tight loop.
pub const MIN_TIMER_SLEEP: Duration = Duration::from_millis(100);

/// The two expiry classes a live session can belong to.
///
/// Each class owns one time-ordered queue and one timer. What the classes
/// *mean* is up to the translator's state machine; the tables only guarantee
/// the timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpiryClass {
    Established,
    Transitory,
}

impl ExpiryClass {
    pub(crate) fn idx(self) -> usize {
        match self {
            ExpiryClass::Established => 0,
            ExpiryClass::Transitory => 1,
        }
    }
}

/// What the translator's state machine decided for an expired session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The session dies now.
    Die,
    /// The session gets one more transitory-length wait, during which the
    /// translator must probe the connection to find out whether it is still
    /// alive.
    Probe,
}

/// Classifies expired sessions.
///
/// Runs with the session-table lock held, so it must not block or call back
/// into the table.
pub trait ExpiryPolicy: Send + Sync {
    fn on_expire(&self, session: &Session) -> Verdict;
}

/// Kills every expired session. The right policy for protocols without a
/// connection state machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct DieOnTimeout;

impl ExpiryPolicy for DieOnTimeout {
    fn on_expire(&self, _: &Session) -> Verdict {
        Verdict::Die
    }
}

/// A deadline the caller must wake the table at, via
/// [`SessionTable::handle_timer`](crate::SessionTable::handle_timer).
///
/// The tables arm no timers themselves; whoever drives them owns the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub class: ExpiryClass,
    pub deadline: Instant,
}

/// Initial timeout and classifier of one expiry class.
pub struct ExpirerConfig {
    pub timeout: Duration,
    pub policy: Arc<dyn ExpiryPolicy>,
}

impl ExpirerConfig {
    pub fn new(timeout: Duration, policy: Arc<dyn ExpiryPolicy>) -> Self {
        Self { timeout, policy }
    }
}

/// The lock-free half of an expiry class: its timeout is readable on the
/// packet path and settable by configuration at any time.
pub(crate) struct Expirer {
    timeout: AtomicU64,
    pub(crate) policy: Arc<dyn ExpiryPolicy>,
}

impl Expirer {
    pub(crate) fn new(config: ExpirerConfig) -> Self {
        Self {
            timeout: AtomicU64::new(config.timeout.as_nanos() as u64),
            policy: config.policy,
        }
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout.load(Ordering::Relaxed))
    }

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        self.timeout
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);
    }
}
