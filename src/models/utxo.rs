//! Bitcoin UTXO models for bridged deposits.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::u64_str;

/// Confirmations the minter requires before it sweeps a UTXO.
pub const MIN_CONFIRMATIONS: u32 = 6;

/// Time a UTXO must sit past its block time before we ask the minter to
/// sweep it, so we do not race the minter's own confirmation check.
pub const SETTLE_BUFFER_SECS: i64 = 60;

/// An unspent output paying a deposit address. Identified by `txid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    #[serde(default)]
    pub vout: u32,
    /// Value in satoshis.
    pub amount: u64,
    /// Time of the block that included the transaction (`None` while in
    /// the mempool).
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub block_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub confirmations: u32,
}

/// Where a UTXO sits in the deposit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UtxoStage {
    /// Seen in the mempool, not yet mined.
    Observed,
    /// Mined but not yet deep or old enough for the minter.
    Confirmed,
    /// Deep and old enough; a balance update will sweep it.
    Matured,
}

impl Utxo {
    /// Classifies this UTXO at `now`.
    #[must_use]
    pub fn stage(&self, now: DateTime<Utc>) -> UtxoStage {
        if self.confirmations == 0 {
            return UtxoStage::Observed;
        }
        let settled = self
            .block_time
            .is_some_and(|t| now - t > Duration::seconds(SETTLE_BUFFER_SECS));
        if self.confirmations >= MIN_CONFIRMATIONS && settled {
            UtxoStage::Matured
        } else {
            UtxoStage::Confirmed
        }
    }
}

/// Per-UTXO outcome of a minter balance update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateBalanceStatus {
    /// Below the minter's minimum; ignored.
    ValueTooSmall { txid: String },
    /// Rejected by the minter's screening.
    Tainted { txid: String },
    /// Accepted; minting is pending.
    Checked { txid: String },
    /// Wrapped tokens were minted for the UTXO.
    Minted {
        txid: String,
        #[serde(with = "u64_str")]
        block_index: u64,
        #[serde(with = "u64_str")]
        minted_amount: u64,
    },
}
