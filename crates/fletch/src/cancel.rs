//! Long running query operations need to be cancellable. Every query carries
//! a shared token; iterator loops, prefilter walks and fanout callbacks poll
//! it per record and bail out as soon as it reports cancellation.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config;
use crate::metrics;

pub trait Cancellation: Send + Sync {
    /// Cancellation latches: once this returns true it keeps returning true.
    fn is_cancelled(&self) -> bool;
    fn cancel(&self);
}

pub type Token = Arc<dyn Cancellation>;

/// Deadline-driven token. Reading the monotonic clock on every poll is too
/// expensive for per-record polling, so only every N-th call actually
/// compares against the deadline.
pub struct DeadlineToken {
    cancelled: AtomicBool,
    deadline: Instant,
    polls: AtomicU32,
}

impl DeadlineToken {
    pub fn new(timeout_ms: u64) -> Token {
        Arc::new(DeadlineToken {
            cancelled: AtomicBool::new(false),
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
            polls: AtomicU32::new(0),
        })
    }
}

impl Cancellation for DeadlineToken {
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Relaxed) {
            return true;
        }
        let polls = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
        if u64::from(polls) >= config::timeout_poll_frequency() {
            self.polls.store(0, Ordering::Relaxed);
            if Instant::now() >= self.deadline || config::debug_force_timeout() {
                self.cancelled.store(true, Ordering::Relaxed);
                metrics::stats().cancellation_timeouts.incr();
                return true;
            }
        }
        false
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

/// A token that can only be cancelled explicitly. Used by operations that
/// have no deadline of their own (tests, internal fanout rounds).
#[derive(Default)]
pub struct ManualToken {
    cancelled: AtomicBool,
}

impl ManualToken {
    pub fn token() -> Token {
        Arc::new(ManualToken::default())
    }
}

impl Cancellation for ManualToken {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_expires() {
        let token = DeadlineToken::new(0);
        // enough polls to cross the amortization window
        let polls = config::timeout_poll_frequency() + 1;
        let mut cancelled = false;
        for _ in 0..polls {
            cancelled = token.is_cancelled();
        }
        assert!(cancelled);
        // latches
        assert!(token.is_cancelled());
    }

    #[test]
    fn far_deadline_not_cancelled() {
        let token = DeadlineToken::new(60_000);
        for _ in 0..500 {
            assert!(!token.is_cancelled());
        }
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn manual_token_latches() {
        let token = ManualToken::token();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
