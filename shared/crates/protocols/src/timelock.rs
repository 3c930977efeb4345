//! Four-window timelock contract shared by both escrows of a pair.
//!
//! The windows must be identical on both sides; the orchestrator
//! builds them once per scope and reuses them for src and dst
//! invocations.

use serde::{Deserialize, Serialize};

use crate::OrderError;

/// The four escrow windows, as unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timelocks {
    pub withdrawal_start: u64,
    pub public_withdrawal_start: u64,
    pub cancellation_start: u64,
    pub public_cancellation_start: u64,
}

/// Who may act on the escrow at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelockStage {
    /// Before `withdrawal_start`: nobody may withdraw.
    Sealed,
    /// Only the designated recipient may withdraw.
    PrivateWithdrawal,
    /// Anyone may trigger the withdrawal.
    PublicWithdrawal,
    /// The creator may cancel and reclaim.
    PrivateCancellation,
    /// Anyone may trigger the reclaim.
    PublicCancellation,
}

impl Timelocks {
    /// Build windows from a base instant and per-window offsets.
    pub fn from_offsets(
        base: u64,
        withdrawal: u64,
        public_withdrawal: u64,
        cancellation: u64,
        public_cancellation: u64,
    ) -> Result<Self, OrderError> {
        let timelocks = Timelocks {
            withdrawal_start: base + withdrawal,
            public_withdrawal_start: base + public_withdrawal,
            cancellation_start: base + cancellation,
            public_cancellation_start: base + public_cancellation,
        };
        timelocks.validate()?;
        Ok(timelocks)
    }

    /// Enforce strict window ordering:
    /// `withdrawal < public_withdrawal < cancellation < public_cancellation`.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.public_withdrawal_start <= self.withdrawal_start
            || self.cancellation_start <= self.public_withdrawal_start
            || self.public_cancellation_start <= self.cancellation_start
        {
            return Err(OrderError::InvalidTimelocks(format!(
                "windows must be strictly increasing: {} < {} < {} < {}",
                self.withdrawal_start,
                self.public_withdrawal_start,
                self.cancellation_start,
                self.public_cancellation_start,
            )));
        }
        Ok(())
    }

    /// Stage of the escrow at `now` (unix seconds).
    pub fn stage(&self, now: u64) -> TimelockStage {
        if now < self.withdrawal_start {
            TimelockStage::Sealed
        } else if now < self.public_withdrawal_start {
            TimelockStage::PrivateWithdrawal
        } else if now < self.cancellation_start {
            TimelockStage::PublicWithdrawal
        } else if now < self.public_cancellation_start {
            TimelockStage::PrivateCancellation
        } else {
            TimelockStage::PublicCancellation
        }
    }

    /// Whether `actor_is_recipient` may withdraw at `now`.
    pub fn may_withdraw(&self, now: u64, actor_is_recipient: bool) -> bool {
        match self.stage(now) {
            TimelockStage::PrivateWithdrawal => actor_is_recipient,
            TimelockStage::PublicWithdrawal => true,
            _ => false,
        }
    }

    /// Whether `actor_is_creator` may cancel at `now`.
    pub fn may_cancel(&self, now: u64, actor_is_creator: bool) -> bool {
        match self.stage(now) {
            TimelockStage::PrivateCancellation => actor_is_creator,
            TimelockStage::PublicCancellation => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Timelocks {
        Timelocks::from_offsets(1_000, 10, 60, 300, 600).unwrap()
    }

    #[test]
    fn test_windows_strictly_increasing() {
        let t = sample();
        assert!(t.withdrawal_start < t.public_withdrawal_start);
        assert!(t.public_withdrawal_start < t.cancellation_start);
        assert!(t.cancellation_start < t.public_cancellation_start);
    }

    #[test]
    fn test_non_monotonic_windows_rejected() {
        let bad = Timelocks {
            withdrawal_start: 100,
            public_withdrawal_start: 100,
            cancellation_start: 200,
            public_cancellation_start: 300,
        };
        assert!(matches!(bad.validate(), Err(OrderError::InvalidTimelocks(_))));
    }

    #[test]
    fn test_stage_progression() {
        let t = sample();
        assert_eq!(t.stage(1_005), TimelockStage::Sealed);
        assert_eq!(t.stage(1_010), TimelockStage::PrivateWithdrawal);
        assert_eq!(t.stage(1_060), TimelockStage::PublicWithdrawal);
        assert_eq!(t.stage(1_300), TimelockStage::PrivateCancellation);
        assert_eq!(t.stage(1_600), TimelockStage::PublicCancellation);
    }

    #[test]
    fn test_withdraw_and_cancel_gating() {
        let t = sample();
        assert!(!t.may_withdraw(1_005, true));
        assert!(t.may_withdraw(1_010, true));
        assert!(!t.may_withdraw(1_010, false));
        assert!(t.may_withdraw(1_060, false));
        assert!(!t.may_cancel(1_060, true));
        assert!(t.may_cancel(1_300, true));
        assert!(!t.may_cancel(1_300, false));
        assert!(t.may_cancel(1_600, false));
    }
}
