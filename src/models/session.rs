//! Clearing session descriptor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LedgerId;
use crate::fixed_point::Amount;

/// The next clearing session as reported by the exchange.
///
/// `counter` increases by one per session and `clearing_timestamp`
/// strictly increases between sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub counter: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub clearing_timestamp: DateTime<Utc>,
}

/// Price an asset settled at in the most recent clearing, in quote
/// smallest units per whole base token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearingPrice {
    pub ledger: LedgerId,
    pub price: Amount,
}
