//! Timeout, retry and duplicate policy
//!
//! Shared by every role. The controller only decides; the transfer context
//! performs the resend and the state machine turns a give-up into a failure.
//!
//! Duplicate ACKs never trigger a resend. Answering them with another copy
//! of the DATA block is what lets two peers fall into the Sorcerer's
//! Apprentice loop, where every block ends up being sent twice forever.

use std::time::Duration;

use crate::error::TimeoutKind;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRIES: u32 = 3;
/// Consecutive duplicates tolerated before the transfer is abandoned
pub const MAX_DUPS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// Resend the last packet and wait again
    Retry,
    GiveUp(TimeoutKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDecision {
    /// Repeat our last packet once
    Resend,
    Ignore,
    /// Too many consecutive duplicates
    Abort,
}

/// A packet we had already seen or already answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplicate {
    /// DATA for a block we already acknowledged: our ACK got lost
    Data(u16),
    /// OACK again after we answered it (ACK 0 or DATA 1 lost)
    Oack,
    /// ACK for a block before the one in flight
    Ack(u16),
}

#[derive(Debug, Clone)]
pub struct RetransmissionController {
    timeout: Duration,
    max_retries: u32,
    max_dups: u32,
    retries_remaining: u32,
    consecutive_dups: u32,
    duplicate_acks_seen: bool,
}

impl RetransmissionController {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
            max_dups: MAX_DUPS,
            retries_remaining: max_retries,
            consecutive_dups: 0,
            duplicate_acks_seen: false,
        }
    }

    pub fn with_max_dups(mut self, max_dups: u32) -> Self {
        self.max_dups = max_dups;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn max_dups(&self) -> u32 {
        self.max_dups
    }

    pub fn consecutive_duplicates(&self) -> u32 {
        self.consecutive_dups
    }

    pub fn on_timeout(&mut self) -> TimeoutDecision {
        if self.retries_remaining > 0 {
            self.retries_remaining -= 1;
            TimeoutDecision::Retry
        } else if self.duplicate_acks_seen {
            TimeoutDecision::GiveUp(TimeoutKind::ExpectAck)
        } else {
            TimeoutDecision::GiveUp(TimeoutKind::NoResponse)
        }
    }

    pub fn on_duplicate(&mut self, duplicate: Duplicate) -> DuplicateDecision {
        self.consecutive_dups += 1;
        if self.consecutive_dups > self.max_dups {
            return DuplicateDecision::Abort;
        }

        match duplicate {
            Duplicate::Data(_) | Duplicate::Oack => DuplicateDecision::Resend,
            Duplicate::Ack(_) => {
                self.duplicate_acks_seen = true;
                DuplicateDecision::Ignore
            }
        }
    }

    /// The transfer advanced by one block: refill the budgets
    pub fn on_progress(&mut self) {
        self.retries_remaining = self.max_retries;
        self.consecutive_dups = 0;
        self.duplicate_acks_seen = false;
    }
}

impl Default for RetransmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_then_gives_up() {
        let mut controller = RetransmissionController::new(Duration::from_secs(5), 3);
        assert_eq!(controller.on_timeout(), TimeoutDecision::Retry);
        assert_eq!(controller.on_timeout(), TimeoutDecision::Retry);
        assert_eq!(controller.on_timeout(), TimeoutDecision::Retry);
        assert_eq!(
            controller.on_timeout(),
            TimeoutDecision::GiveUp(TimeoutKind::NoResponse)
        );
    }

    #[test]
    fn progress_refills_retry_budget() {
        let mut controller = RetransmissionController::new(Duration::from_secs(1), 1);
        assert_eq!(controller.on_timeout(), TimeoutDecision::Retry);
        controller.on_progress();
        assert_eq!(controller.retries_remaining(), 1);
        assert_eq!(controller.on_timeout(), TimeoutDecision::Retry);
    }

    #[test]
    fn duplicate_acks_flavour_the_final_timeout() {
        let mut controller = RetransmissionController::new(Duration::from_secs(1), 0);
        assert_eq!(controller.on_duplicate(Duplicate::Ack(4)), DuplicateDecision::Ignore);
        assert_eq!(
            controller.on_timeout(),
            TimeoutDecision::GiveUp(TimeoutKind::ExpectAck)
        );
    }

    #[test]
    fn duplicate_data_is_answered() {
        let mut controller = RetransmissionController::default();
        assert_eq!(controller.on_duplicate(Duplicate::Data(9)), DuplicateDecision::Resend);
        assert_eq!(controller.on_duplicate(Duplicate::Oack), DuplicateDecision::Resend);
    }

    #[test]
    fn aborts_after_max_consecutive_duplicates() {
        let mut controller = RetransmissionController::default();
        for _ in 0..MAX_DUPS {
            assert_eq!(controller.on_duplicate(Duplicate::Data(1)), DuplicateDecision::Resend);
        }
        assert_eq!(controller.on_duplicate(Duplicate::Data(1)), DuplicateDecision::Abort);
    }

    #[test]
    fn progress_resets_duplicate_run() {
        let mut controller = RetransmissionController::default().with_max_dups(2);
        controller.on_duplicate(Duplicate::Ack(1));
        controller.on_duplicate(Duplicate::Ack(1));
        controller.on_progress();
        assert_eq!(controller.consecutive_duplicates(), 0);
        assert_eq!(controller.on_duplicate(Duplicate::Ack(2)), DuplicateDecision::Ignore);
    }
}
