//! Exchange credit and deposit-notification models.

use serde::{Deserialize, Serialize};

use super::LedgerId;
use crate::fixed_point::Amount;

/// Funds the exchange has internally recognized for a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credits {
    pub total: Amount,
    /// Reserved by open orders.
    pub locked: Amount,
    pub available: Amount,
}

/// Credits for one ledger, as listed by `query_credits`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditEntry {
    pub ledger: LedgerId,
    #[serde(flatten)]
    pub credits: Credits,
}

/// Outcome of asking the exchange to pick up a direct deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResult {
    pub credit_increase: Amount,
    pub deposit_increase: Amount,
    pub new_total: Amount,
}
