//! Domain and wire models shared by the clients and the engine.
//!
//! Collaborator responses are wrapped in an [`ApiEnvelope`]; big integer
//! fields travel as decimal strings (see [`crate::fixed_point::Amount`] and
//! [`u64_str`]).

pub mod account;
pub mod asset;
pub mod credit;
pub mod order;
pub mod session;
pub mod settings;
pub mod utxo;
pub mod withdrawal;

pub use account::{Account, Subaccount};
pub use asset::{Asset, AssetRegistry, LedgerId, LedgerMetadata};
pub use credit::{CreditEntry, Credits, NotifyResult};
pub use order::{
    OpenOrder, OrderAck, OrderId, OrderSide, PlaceOrderRequest, ReplaceOrderRequest,
};
pub use session::{ClearingPrice, SessionDescriptor};
pub use settings::OrderSettings;
pub use utxo::{UpdateBalanceStatus, Utxo, UtxoStage};
pub use withdrawal::{PendingWithdrawal, WithdrawalStatus};

use serde::Deserialize;

/// Response envelope used by every collaborator HTTP API:
/// `{"error": [...], "result": ...}`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub error: Vec<String>,
    pub result: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Converts the envelope into the payload, turning a non-empty error
    /// list into [`BatchSyncError::Exchange`](crate::BatchSyncError::Exchange)
    /// and a missing payload into
    /// [`BatchSyncError::MalformedMessage`](crate::BatchSyncError::MalformedMessage).
    pub fn into_result(self, what: &str) -> crate::Result<T> {
        if !self.error.is_empty() {
            return Err(crate::BatchSyncError::Exchange(self.error.join(", ")));
        }
        self.result.ok_or_else(|| {
            crate::BatchSyncError::MalformedMessage(format!("missing result in {what} response"))
        })
    }
}

/// Serde adapter for `u64` values persisted as decimal strings.
pub mod u64_str {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(n),
            Repr::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}
