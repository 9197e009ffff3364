//! Bitcoin bridge flows: inbound UTXO deposits and outbound withdrawals.

pub mod utxo;
pub mod withdrawal;

pub use utxo::{PollOutcome, UTXO_POLL_PERIOD, UtxoSnapshot, UtxoWatcher};
pub use withdrawal::{
    BalanceRefresher, WITHDRAWAL_POLL_PERIOD, WithdrawalPollReport, WithdrawalPoller,
};
