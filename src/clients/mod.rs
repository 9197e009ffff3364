//! Remote collaborators.
//!
//! The engine never talks to the network directly. It goes through the
//! four traits below so tests can substitute in-memory fakes and the
//! daemon can plug in the reqwest-backed implementations from the
//! submodules.

pub mod esplora;
pub mod exchange;
pub mod ledger;
pub mod minter;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::fixed_point::Amount;
use crate::models::{
    Account, ClearingPrice, CreditEntry, LedgerId, LedgerMetadata, NotifyResult, OpenOrder,
    OrderAck, OrderId, OrderSettings, PlaceOrderRequest, ReplaceOrderRequest,
    SessionDescriptor, UpdateBalanceStatus, Utxo, WithdrawalStatus,
};

pub use esplora::EsploraClient;
pub use exchange::HttpExchangeClient;
pub use ledger::HttpLedgerClient;
pub use minter::HttpMinterClient;
pub use registry::{ClientFactory, ClientRegistry, HttpClientFactory};

/// The batch-auction exchange.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Principal that owns the deposit subaccounts on every ledger.
    fn principal(&self) -> &str;

    /// Ledgers listed for trading.
    async fn query_assets(&self) -> Result<Vec<LedgerId>>;

    /// Ledger every price is quoted in.
    async fn query_quote_ledger(&self) -> Result<LedgerId>;

    async fn query_settings(&self) -> Result<OrderSettings>;

    /// The next clearing session.
    async fn query_next_session(&self) -> Result<SessionDescriptor>;

    /// Prices of the most recent clearing.
    async fn query_clearing_prices(&self) -> Result<Vec<ClearingPrice>>;

    /// Orders of the authenticated user still waiting for a clearing.
    async fn query_open_orders(&self) -> Result<Vec<OpenOrder>>;

    /// Credits of the authenticated user, for one ledger or all of them.
    async fn query_credits(&self, ledger: Option<&LedgerId>) -> Result<Vec<CreditEntry>>;

    /// Portion of the deposit subaccount balance the exchange already
    /// knows about.
    async fn query_tracked_deposit(&self, ledger: &LedgerId) -> Result<Amount>;

    /// Asks the exchange to credit whatever sits untracked in the deposit
    /// subaccount.
    async fn notify_deposit(&self, ledger: &LedgerId) -> Result<NotifyResult>;

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck>;

    async fn replace_order(&self, request: &ReplaceOrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, order_id: OrderId) -> Result<()>;
}

/// A token ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn metadata(&self, ledger: &LedgerId) -> Result<LedgerMetadata>;

    async fn balance_of(&self, ledger: &LedgerId, account: &Account) -> Result<Amount>;

    async fn allowance(&self, ledger: &LedgerId, owner: &Account, spender: &Account) -> Result<Amount>;
}

/// The Bitcoin bridge minter.
#[async_trait]
pub trait MinterClient: Send + Sync {
    /// UTXOs the minter has already swept for `owner`.
    async fn list_known_utxos(&self, owner: &str) -> Result<Vec<Utxo>>;

    /// Asks the minter to sweep matured UTXOs paying `owner`'s deposit
    /// address.
    async fn update_balance(&self, owner: &str) -> Result<Vec<UpdateBalanceStatus>>;

    async fn withdrawal_status(&self, block_index: u64) -> Result<WithdrawalStatus>;
}

/// A Bitcoin block explorer.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Unspent outputs paying `address`, with confirmations derived from
    /// the current tip.
    async fn list_utxos(&self, address: &str) -> Result<Vec<Utxo>>;
}

/// One set of collaborators bound to a credential.
#[derive(Clone)]
pub struct Clients {
    pub exchange: Arc<dyn ExchangeClient>,
    pub ledger: Arc<dyn LedgerClient>,
    pub minter: Arc<dyn MinterClient>,
    pub block_source: Arc<dyn BlockSource>,
}

impl std::fmt::Debug for Clients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clients")
            .field("exchange", &self.exchange.principal())
            .finish_non_exhaustive()
    }
}

/// Builds a reqwest client, trusting only `tls` roots when given.
pub(crate) fn http_client(tls: Option<&rustls::ClientConfig>) -> Result<reqwest::Client> {
    let builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30));
    let builder = match tls {
        Some(config) => builder.use_preconfigured_tls(config.clone()),
        None => builder,
    };
    builder
        .build()
        .map_err(|e| crate::BatchSyncError::Tls(format!("failed to build HTTP client: {e}")))
}

/// Joins a base URL and a path without doubling slashes.
pub(crate) fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
