//! User-facing notifications.
//!
//! Background loops stay silent on failure. Only state changes the user
//! cares about and the outcome of user-initiated actions produce a
//! [`SyncEvent`]. Delivery is fire-and-forget over an unbounded channel; a
//! dropped receiver is not an error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::trace;

use crate::fixed_point::Amount;
use crate::models::{LedgerId, NotifyResult, OrderId, WithdrawalStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A new UTXO paying the deposit address was seen on chain.
    DepositDetected {
        address: String,
        txid: String,
        amount_sats: u64,
    },
    /// The minter swept a UTXO; wrapped tokens are available.
    DepositCompleted {
        address: String,
        txid: String,
        amount_sats: u64,
    },
    WithdrawalStatusChanged {
        block_index: u64,
        status: WithdrawalStatus,
    },
    /// The withdrawal reached a terminal status and is no longer tracked.
    WithdrawalFinalized {
        block_index: u64,
        status: WithdrawalStatus,
    },
    SessionAdvanced {
        counter: u64,
        clearing_timestamp: DateTime<Utc>,
    },
    BalancesRefreshed {
        session: Option<u64>,
    },
    /// The credential expired and every background task was stopped.
    LoggedOut {
        reason: String,
    },
    ClaimSucceeded {
        ledger: LedgerId,
        symbol: String,
        claimed: Amount,
        result: NotifyResult,
        elapsed: Duration,
    },
    ClaimFailed {
        ledger: LedgerId,
        symbol: String,
        error: String,
        elapsed: Duration,
    },
    OrderPlaced {
        order_id: OrderId,
        elapsed: Duration,
    },
    OrderCancelled {
        order_id: OrderId,
        elapsed: Duration,
    },
    OrderFailed {
        error: String,
        elapsed: Duration,
    },
}

/// Sending half shared by every component.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl Notifier {
    /// Creates a notifier and the receiver the UI listens on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A notifier that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            trace!("Event receiver dropped");
        }
    }
}
