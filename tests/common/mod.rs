//! Shared test utilities: in-memory collaborators and a controllable clock.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use batchsync::auth::Credential;
use batchsync::clients::{
    BlockSource, ClientFactory, ClientRegistry, Clients, ExchangeClient, LedgerClient, MinterClient,
};
use batchsync::fixed_point::Amount;
use batchsync::models::{
    Account, ClearingPrice, CreditEntry, Credits, LedgerId, LedgerMetadata, NotifyResult,
    OpenOrder, OrderAck, OrderId, OrderSettings, PlaceOrderRequest, ReplaceOrderRequest,
    SessionDescriptor, UpdateBalanceStatus, Utxo, WithdrawalStatus,
};
use batchsync::timer::WallClock;
use batchsync::{BatchSyncError, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

pub const USER: &str = "user-1";
pub const EXCHANGE_PRINCIPAL: &str = "exchange";
pub const BTC_ADDRESS: &str = "bc1qtestaddress";

pub fn btc() -> LedgerId {
    LedgerId::new("ckbtc")
}

pub fn usdc() -> LedgerId {
    LedgerId::new("ckusdc")
}

pub fn deposit_account() -> Account {
    Account::deposit_account(EXCHANGE_PRINCIPAL, USER)
}

/// Wall-clock time that follows tokio's (possibly paused) clock.
#[derive(Debug)]
pub struct TestClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl TestClock {
    /// Starts on a whole minute so session boundaries are round numbers.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            anchor_wall: Utc.with_ymd_and_hms(2025, 10, 19, 12, 0, 0).unwrap(),
            anchor: tokio::time::Instant::now(),
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.anchor_wall
    }
}

impl WallClock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now() - self.anchor;
        self.anchor_wall + chrono::Duration::from_std(elapsed).unwrap()
    }
}

#[derive(Debug, Default)]
pub struct LedgerState {
    pub metadata: HashMap<LedgerId, LedgerMetadata>,
    pub balances: HashMap<(LedgerId, Account), Amount>,
    pub fail_balance: bool,
}

#[derive(Debug, Default)]
pub struct FakeLedger {
    pub state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn set_balance(&self, ledger: &LedgerId, account: &Account, amount: u64) {
        self.state
            .lock()
            .balances
            .insert((ledger.clone(), account.clone()), Amount::from(amount));
    }

    fn balance(&self, ledger: &LedgerId, account: &Account) -> Amount {
        self.state
            .lock()
            .balances
            .get(&(ledger.clone(), account.clone()))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn metadata(&self, ledger: &LedgerId) -> Result<LedgerMetadata> {
        self.state
            .lock()
            .metadata
            .get(ledger)
            .cloned()
            .ok_or_else(|| BatchSyncError::Exchange(format!("unknown ledger {ledger}")))
    }

    async fn balance_of(&self, ledger: &LedgerId, account: &Account) -> Result<Amount> {
        if self.state.lock().fail_balance {
            return Err(BatchSyncError::Exchange("ledger unavailable".into()));
        }
        Ok(self.balance(ledger, account))
    }

    async fn allowance(&self, _: &LedgerId, _: &Account, _: &Account) -> Result<Amount> {
        Ok(Amount::ZERO)
    }
}

#[derive(Debug, Default)]
pub struct ExchangeState {
    pub assets: Vec<LedgerId>,
    pub quote: Option<LedgerId>,
    pub settings: Option<OrderSettings>,
    pub credits: Vec<CreditEntry>,
    pub clearing_prices: Vec<ClearingPrice>,
    pub open_orders: Vec<OpenOrder>,
    pub tracked: HashMap<LedgerId, Amount>,
    /// Reported instead of the computed session while set.
    pub frozen_session: Option<SessionDescriptor>,
    pub fail_sessions: bool,
    pub notify_delay: Option<Duration>,
    pub notify_calls: usize,
    pub session_queries: usize,
    pub credit_queries: usize,
    /// Wall time at which each credits query was answered.
    pub credit_answers: Vec<DateTime<Utc>>,
    pub credits_delay: Option<Duration>,
    pub settings_queries: usize,
    pub order_queries: usize,
    pub placed: Vec<PlaceOrderRequest>,
    pub replaced: Vec<ReplaceOrderRequest>,
    pub cancelled: Vec<OrderId>,
    pub next_order_id: u64,
}

/// Exchange whose sessions clear every `session_period`, aligned to the
/// clock's start.
pub struct FakeExchange {
    pub state: Mutex<ExchangeState>,
    ledger: Arc<FakeLedger>,
    wall: Arc<TestClock>,
    session_period: i64,
}

impl FakeExchange {
    fn computed_session(&self) -> SessionDescriptor {
        let elapsed = (self.wall.now() - self.wall.start()).num_milliseconds();
        let period_ms = self.session_period * 1000;
        let counter = elapsed / period_ms + 1;
        SessionDescriptor {
            counter: counter as u64,
            clearing_timestamp: self.wall.start() + chrono::Duration::milliseconds(counter * period_ms),
        }
    }
}

#[async_trait]
impl ExchangeClient for FakeExchange {
    fn principal(&self) -> &str {
        EXCHANGE_PRINCIPAL
    }

    async fn query_assets(&self) -> Result<Vec<LedgerId>> {
        Ok(self.state.lock().assets.clone())
    }

    async fn query_quote_ledger(&self) -> Result<LedgerId> {
        self.state
            .lock()
            .quote
            .clone()
            .ok_or_else(|| BatchSyncError::Exchange("no quote ledger".into()))
    }

    async fn query_settings(&self) -> Result<OrderSettings> {
        let mut state = self.state.lock();
        state.settings_queries += 1;
        state
            .settings
            .ok_or_else(|| BatchSyncError::Exchange("no settings".into()))
    }

    async fn query_next_session(&self) -> Result<SessionDescriptor> {
        let (frozen, fail) = {
            let mut state = self.state.lock();
            state.session_queries += 1;
            (state.frozen_session, state.fail_sessions)
        };
        if fail {
            return Err(BatchSyncError::Exchange("session unavailable".into()));
        }
        Ok(frozen.unwrap_or_else(|| self.computed_session()))
    }

    async fn query_clearing_prices(&self) -> Result<Vec<ClearingPrice>> {
        Ok(self.state.lock().clearing_prices.clone())
    }

    async fn query_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let mut state = self.state.lock();
        state.order_queries += 1;
        Ok(state.open_orders.clone())
    }

    async fn query_credits(&self, _ledger: Option<&LedgerId>) -> Result<Vec<CreditEntry>> {
        let delay = {
            let mut state = self.state.lock();
            state.credit_queries += 1;
            state.credits_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.credit_answers.push(self.wall.now());
        Ok(state.credits.clone())
    }

    async fn query_tracked_deposit(&self, ledger: &LedgerId) -> Result<Amount> {
        Ok(self.state.lock().tracked.get(ledger).copied().unwrap_or_default())
    }

    async fn notify_deposit(&self, ledger: &LedgerId) -> Result<NotifyResult> {
        let delay = {
            let mut state = self.state.lock();
            state.notify_calls += 1;
            state.notify_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let balance = self.ledger.balance(ledger, &deposit_account());
        let mut state = self.state.lock();
        let previous = state.tracked.get(ledger).copied().unwrap_or_default();
        let increase = balance.saturating_sub(previous);
        state.tracked.insert(ledger.clone(), balance);
        Ok(NotifyResult {
            credit_increase: increase,
            deposit_increase: increase,
            new_total: balance,
        })
    }

    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<OrderAck> {
        let mut state = self.state.lock();
        state.next_order_id += 1;
        let order_id = OrderId(state.next_order_id);
        state.placed.push(request.clone());
        state.open_orders.push(OpenOrder {
            order_id,
            ledger: request.ledger.clone(),
            side: request.side,
            volume: request.volume,
            price: request.price,
        });
        Ok(OrderAck { order_id })
    }

    async fn replace_order(&self, request: &ReplaceOrderRequest) -> Result<OrderAck> {
        let mut state = self.state.lock();
        state.next_order_id += 1;
        let order_id = OrderId(state.next_order_id);
        state.replaced.push(request.clone());
        if let Some(order) = state
            .open_orders
            .iter_mut()
            .find(|o| o.order_id == request.order_id)
        {
            order.order_id = order_id;
            order.volume = request.volume;
            order.price = request.price;
        }
        Ok(OrderAck { order_id })
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<()> {
        let mut state = self.state.lock();
        if order_id.0 == 0 || order_id.0 > state.next_order_id {
            return Err(BatchSyncError::Exchange(format!("unknown order {order_id}")));
        }
        state.cancelled.push(order_id);
        state.open_orders.retain(|o| o.order_id != order_id);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MinterState {
    pub known: Vec<Utxo>,
    /// Swept into `known` on the next balance update.
    pub sweepable: Vec<Utxo>,
    /// Reported on every balance update, for UTXOs the minter refuses.
    pub rejections: Vec<UpdateBalanceStatus>,
    pub update_calls: usize,
    pub statuses: HashMap<u64, WithdrawalStatus>,
    pub status_calls: usize,
}

#[derive(Debug, Default)]
pub struct FakeMinter {
    pub state: Mutex<MinterState>,
}

#[async_trait]
impl MinterClient for FakeMinter {
    async fn list_known_utxos(&self, _owner: &str) -> Result<Vec<Utxo>> {
        Ok(self.state.lock().known.clone())
    }

    async fn update_balance(&self, _owner: &str) -> Result<Vec<UpdateBalanceStatus>> {
        let mut state = self.state.lock();
        state.update_calls += 1;
        let swept: Vec<Utxo> = state.sweepable.drain(..).collect();
        let mut statuses: Vec<UpdateBalanceStatus> = swept
            .iter()
            .map(|u| UpdateBalanceStatus::Checked { txid: u.txid.clone() })
            .collect();
        statuses.extend(state.rejections.iter().cloned());
        state.known.extend(swept);
        Ok(statuses)
    }

    async fn withdrawal_status(&self, block_index: u64) -> Result<WithdrawalStatus> {
        let mut state = self.state.lock();
        state.status_calls += 1;
        Ok(state
            .statuses
            .get(&block_index)
            .cloned()
            .unwrap_or(WithdrawalStatus::Unknown))
    }
}

#[derive(Debug, Default)]
pub struct BlockState {
    pub utxos: Vec<Utxo>,
    pub list_calls: usize,
    pub delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct FakeBlockSource {
    pub state: Mutex<BlockState>,
}

#[async_trait]
impl BlockSource for FakeBlockSource {
    async fn list_utxos(&self, _address: &str) -> Result<Vec<Utxo>> {
        let delay = {
            let mut state = self.state.lock();
            state.list_calls += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().utxos.clone())
    }
}

/// Every collaborator, pre-loaded with a BTC/USDC market.
pub struct Venue {
    pub wall: Arc<TestClock>,
    pub exchange: Arc<FakeExchange>,
    pub ledger: Arc<FakeLedger>,
    pub minter: Arc<FakeMinter>,
    pub blocks: Arc<FakeBlockSource>,
}

impl Venue {
    /// A market clearing every `session_period_secs`.
    pub fn new(session_period_secs: i64) -> Self {
        let wall = TestClock::new();
        let ledger = Arc::new(FakeLedger::default());
        {
            let mut state = ledger.state.lock();
            state.metadata.insert(
                btc(),
                LedgerMetadata {
                    symbol: "BTC".into(),
                    decimals: 8,
                    fee: Amount::new(10_000),
                },
            );
            state.metadata.insert(
                usdc(),
                LedgerMetadata {
                    symbol: "USDC".into(),
                    decimals: 6,
                    fee: Amount::new(10_000),
                },
            );
        }

        let exchange = Arc::new(FakeExchange {
            state: Mutex::new(ExchangeState {
                assets: vec![btc()],
                quote: Some(usdc()),
                settings: Some(OrderSettings {
                    minimum_quote_volume: Amount::new(5_000_000),
                    quote_volume_step: Amount::new(10_000),
                    price_digits_limit: 5,
                }),
                credits: vec![CreditEntry {
                    ledger: btc(),
                    credits: Credits {
                        total: Amount::new(100),
                        locked: Amount::ZERO,
                        available: Amount::new(100),
                    },
                }],
                clearing_prices: vec![ClearingPrice {
                    ledger: btc(),
                    price: Amount::new(60_000_000_000),
                }],
                ..ExchangeState::default()
            }),
            ledger: Arc::clone(&ledger),
            wall: Arc::clone(&wall),
            session_period: session_period_secs,
        });

        Self {
            wall,
            exchange,
            ledger,
            minter: Arc::new(FakeMinter::default()),
            blocks: Arc::new(FakeBlockSource::default()),
        }
    }

    pub fn clients(&self) -> Clients {
        Clients {
            exchange: Arc::clone(&self.exchange) as Arc<dyn ExchangeClient>,
            ledger: Arc::clone(&self.ledger) as Arc<dyn LedgerClient>,
            minter: Arc::clone(&self.minter) as Arc<dyn MinterClient>,
            block_source: Arc::clone(&self.blocks) as Arc<dyn BlockSource>,
        }
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::new(ClientRegistry::new(Arc::new(FixedFactory(self.clients()))))
    }
}

/// Hands out the same fakes for every credential.
pub struct FixedFactory(pub Clients);

impl ClientFactory for FixedFactory {
    fn build(&self, _credential: Option<&Credential>) -> Result<Clients> {
        Ok(self.0.clone())
    }
}

/// A mined UTXO with `confirmations`, included `age` before `now`.
pub fn utxo(txid: &str, amount: u64, confirmations: u32, now: DateTime<Utc>, age: i64) -> Utxo {
    Utxo {
        txid: txid.into(),
        vout: 0,
        amount,
        block_time: (confirmations > 0).then(|| now - chrono::Duration::seconds(age)),
        confirmations,
    }
}

/// Lets spawned tasks run without advancing paused time.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
