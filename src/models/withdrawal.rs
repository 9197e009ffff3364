//! Outbound Bitcoin withdrawal models.

use serde::{Deserialize, Serialize};

use super::u64_str;

/// A withdrawal submitted to the minter, persisted until it is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    #[serde(with = "u64_str")]
    pub block_index: u64,
}

/// Minter-reported status of a withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WithdrawalStatus {
    /// The minter has no record of the block index (yet).
    Unknown,
    /// Queued for the next batch.
    Pending,
    /// Being signed.
    Signing,
    /// Signed and being broadcast.
    Sending { txid: String },
    /// Broadcast to the Bitcoin network.
    Submitted { txid: String },
    /// Amount did not cover fees; funds are reimbursed.
    AmountTooLow,
    /// Mined with enough confirmations.
    Confirmed { txid: String },
}

impl WithdrawalStatus {
    /// Terminal statuses end tracking of the withdrawal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Submitted { .. } | Self::AmountTooLow | Self::Confirmed { .. }
        )
    }

    /// Short human label for notifications.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Pending => "pending",
            Self::Signing => "signing",
            Self::Sending { .. } => "sending",
            Self::Submitted { .. } => "submitted",
            Self::AmountTooLow => "amount too low",
            Self::Confirmed { .. } => "confirmed",
        }
    }
}
