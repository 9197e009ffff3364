//! The synchronization engine.
//!
//! [`SyncEngine`] owns every background component and all client state.
//! Consumers read cloned snapshots and issue commands; nothing outside the
//! engine mutates its records.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Credential;
use crate::bitcoin::{BalanceRefresher, UtxoSnapshot, UtxoWatcher, WithdrawalPoller};
use crate::clients::{ClientRegistry, Clients};
use crate::deposit::{self, AutoClaimer, ClaimPreview, DepositReconciler, LastClaimed};
use crate::events::{Notifier, SyncEvent};
use crate::fixed_point::Amount;
use crate::models::{
    Asset, AssetRegistry, CreditEntry, Credits, LedgerId, NotifyResult, OpenOrder, OrderId,
    OrderSettings, OrderSide, PendingWithdrawal, PlaceOrderRequest, ReplaceOrderRequest,
    SessionDescriptor, WithdrawalStatus,
};
use crate::orders;
use crate::session::{SchedulerHandle, SchedulerState, SessionClock, SessionHooks, SessionScheduler};
use crate::store::KvStore;
use crate::timer::{TaskHandle, WallClock};
use crate::{BatchSyncError, Result};

/// Who the engine works for.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Principal whose deposits and credits are reconciled.
    pub user: String,
    /// Bitcoin deposit address to watch, if any.
    pub btc_address: Option<String>,
    pub credential: Option<Credential>,
}

/// Credits per ledger as of the last refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub credits: BTreeMap<LedgerId, Credits>,
    pub session: Option<SessionDescriptor>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// State written by refreshes and read by everything else.
#[derive(Default)]
struct Shared {
    registry: Arc<RwLock<AssetRegistry>>,
    settings: RwLock<Option<OrderSettings>>,
    balances: RwLock<BalanceSnapshot>,
    open_orders: RwLock<Vec<OpenOrder>>,
    clearing_prices: RwLock<BTreeMap<LedgerId, Amount>>,
}

/// What a refresh does when another one is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overlap {
    /// Give up; the running refresh started no earlier than this one.
    Skip,
    /// Wait for the running refresh, then fetch again.
    Follow,
}

/// Performs refreshes; shared by the scheduler, the withdrawal poller
/// and direct commands.
struct Refresher {
    clients: Clients,
    shared: Arc<Shared>,
    notifier: Notifier,
    credential: Option<Credential>,
    wall: Arc<dyn WallClock>,
    /// Serializes refreshes so an older fetch never lands after a newer one.
    refresh_lock: tokio::sync::Mutex<()>,
    logout: CancellationToken,
}

impl Refresher {
    /// Loads listed assets and their ledger metadata.
    async fn load_assets(&self) -> Result<()> {
        let (listed, quote) = tokio::try_join!(
            self.clients.exchange.query_assets(),
            self.clients.exchange.query_quote_ledger(),
        )?;

        let mut ledgers = listed;
        if !ledgers.contains(&quote) {
            ledgers.push(quote.clone());
        }

        let ledger = &self.clients.ledger;
        let assets = try_join_all(ledgers.into_iter().map(|id| async move {
            let metadata = ledger.metadata(&id).await?;
            Ok::<_, BatchSyncError>(Asset::from_metadata(id, metadata))
        }))
        .await?;

        info!(count = assets.len(), quote = %quote, "Loaded asset registry");
        *self.shared.registry.write() = AssetRegistry::new(Some(quote), assets);
        Ok(())
    }

    /// Reloads settings, clearing prices, open orders and credits. Returns
    /// `false` if skipped because of a running refresh.
    async fn refresh_all(
        &self,
        session: Option<&SessionDescriptor>,
        overlap: Overlap,
    ) -> Result<bool> {
        let Some(_guard) = self.acquire(overlap).await else {
            debug!("Refresh already running, skipped");
            return Ok(false);
        };

        let exchange = &self.clients.exchange;
        let (settings, prices, orders, credits) = tokio::try_join!(
            exchange.query_settings(),
            exchange.query_clearing_prices(),
            exchange.query_open_orders(),
            exchange.query_credits(None),
        )?;
        *self.shared.settings.write() = Some(settings);
        *self.shared.clearing_prices.write() =
            prices.into_iter().map(|p| (p.ledger, p.price)).collect();
        *self.shared.open_orders.write() = orders;
        self.store_credits(credits, session.copied());
        Ok(true)
    }

    async fn refresh_credits(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let credits = self.clients.exchange.query_credits(None).await?;
        let session = self.shared.balances.read().session;
        self.store_credits(credits, session);
        Ok(())
    }

    fn store_credits(&self, entries: Vec<CreditEntry>, session: Option<SessionDescriptor>) {
        let snapshot = BalanceSnapshot {
            credits: entries.into_iter().map(|e| (e.ledger, e.credits)).collect(),
            session,
            refreshed_at: Some(self.wall.now()),
        };
        *self.shared.balances.write() = snapshot;
        self.notifier.emit(SyncEvent::BalancesRefreshed {
            session: session.map(|s| s.counter),
        });
    }

    async fn acquire(&self, overlap: Overlap) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match overlap {
            Overlap::Skip => self.refresh_lock.try_lock().ok(),
            Overlap::Follow => Some(self.refresh_lock.lock().await),
        }
    }
}

#[async_trait]
impl SessionHooks for Refresher {
    async fn credential_valid(&self) -> bool {
        self.credential
            .as_ref()
            .is_none_or(|c| !c.is_expired(self.wall.now()))
    }

    async fn on_credential_expired(&self) {
        warn!("Credential expired, logging out");
        self.notifier.emit(SyncEvent::LoggedOut {
            reason: BatchSyncError::CredentialExpired.to_string(),
        });
        self.logout.cancel();
    }

    async fn refresh(&self, session: &SessionDescriptor) {
        self.notifier.emit(SyncEvent::SessionAdvanced {
            counter: session.counter,
            clearing_timestamp: session.clearing_timestamp,
        });
        if let Err(e) = self.refresh_all(Some(session), Overlap::Follow).await {
            warn!(counter = session.counter, "Session refresh failed: {e}");
        }
    }
}

#[async_trait]
impl BalanceRefresher for Refresher {
    async fn refresh_balances(&self) {
        if let Err(e) = self.refresh_credits().await {
            warn!("Balance refresh failed: {e}");
        }
    }
}

/// Background components, disposed together.
struct Components {
    clock: Arc<SessionClock>,
    scheduler: Mutex<Option<SchedulerHandle>>,
    utxo: Option<Arc<UtxoWatcher>>,
    withdrawals: Arc<WithdrawalPoller>,
    auto_claimer: Arc<AutoClaimer>,
}

impl Components {
    fn dispose(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.dispose();
        }
        if let Some(utxo) = &self.utxo {
            utxo.dispose();
        }
        self.withdrawals.dispose();
        self.auto_claimer.dispose();
    }
}

pub struct SyncEngine {
    clients: Clients,
    client_registry: Arc<ClientRegistry>,
    credential: Option<Credential>,
    store: Arc<dyn KvStore>,
    notifier: Notifier,
    wall: Arc<dyn WallClock>,
    shared: Arc<Shared>,
    refresher: Arc<Refresher>,
    reconciler: Arc<DepositReconciler>,
    components: Arc<Components>,
    logout: CancellationToken,
    logout_watch: Mutex<Option<TaskHandle>>,
}

impl SyncEngine {
    /// Wires every component for `options.user`. Nothing runs until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an error if the client bundle cannot be built.
    pub fn new(
        options: EngineOptions,
        client_registry: Arc<ClientRegistry>,
        store: Arc<dyn KvStore>,
        wall: Arc<dyn WallClock>,
        notifier: Notifier,
    ) -> Result<Self> {
        let clients = client_registry.get(options.credential.as_ref())?;
        let shared = Arc::new(Shared::default());
        let logout = CancellationToken::new();

        let refresher = Arc::new(Refresher {
            clients: clients.clone(),
            shared: Arc::clone(&shared),
            notifier: notifier.clone(),
            credential: options.credential.clone(),
            wall: Arc::clone(&wall),
            refresh_lock: tokio::sync::Mutex::new(()),
            logout: logout.clone(),
        });

        let reconciler = Arc::new(DepositReconciler::new(
            Arc::clone(&clients.exchange),
            Arc::clone(&clients.ledger),
            Arc::clone(&store),
            notifier.clone(),
            &options.user,
        ));

        let utxo = options.btc_address.as_ref().map(|address| {
            UtxoWatcher::new(
                address.clone(),
                options.user.clone(),
                Arc::clone(&clients.minter),
                Arc::clone(&clients.block_source),
                Arc::clone(&store),
                Arc::clone(&wall),
                notifier.clone(),
            )
        });

        let withdrawals = WithdrawalPoller::new(
            Arc::clone(&clients.minter),
            Arc::clone(&store),
            notifier.clone(),
            Arc::clone(&refresher) as Arc<dyn BalanceRefresher>,
        );

        let auto_claimer = AutoClaimer::new(
            Arc::clone(&reconciler),
            Arc::clone(&shared.registry),
            Arc::clone(&store),
        );

        let components = Arc::new(Components {
            clock: Arc::new(SessionClock::new(Arc::clone(&clients.exchange))),
            scheduler: Mutex::new(None),
            utxo,
            withdrawals,
            auto_claimer,
        });

        Ok(Self {
            clients,
            client_registry,
            credential: options.credential,
            store,
            notifier,
            wall,
            shared,
            refresher,
            reconciler,
            components,
            logout,
            logout_watch: Mutex::new(None),
        })
    }

    /// Loads reference data, performs the first refresh and starts every
    /// background component.
    ///
    /// # Errors
    ///
    /// Returns [`BatchSyncError::CredentialExpired`] for an expired
    /// credential, or the error that prevented loading the asset registry.
    pub async fn start(&self) -> Result<()> {
        if !self.refresher.credential_valid().await {
            return Err(BatchSyncError::CredentialExpired);
        }

        self.refresher.load_assets().await?;
        let session = self.components.clock.fetch_next_session().await;
        if let Err(e) = self.refresher.refresh_all(session.as_ref(), Overlap::Follow).await {
            warn!("Initial refresh failed: {e}");
        }

        let scheduler = SessionScheduler::new(
            Arc::clone(&self.components.clock),
            Arc::clone(&self.wall),
            Arc::clone(&self.refresher) as Arc<dyn SessionHooks>,
        )
        .spawn();
        if let Some(previous) = self.components.scheduler.lock().replace(scheduler) {
            previous.dispose();
        }

        if let Some(utxo) = &self.components.utxo {
            utxo.spawn();
        }
        if let Err(e) = self.components.withdrawals.start_if_pending() {
            warn!("Failed to read pending withdrawals: {e}");
        }
        self.components.auto_claimer.start();

        let components = Arc::clone(&self.components);
        let registry = Arc::clone(&self.client_registry);
        let credential = self.credential.clone();
        let logout = self.logout.clone();
        let watch = TaskHandle::spawn(move |token| async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = logout.cancelled() => {
                    components.dispose();
                    registry.invalidate(credential.as_ref());
                    info!("Logged out, background tasks stopped");
                }
            }
        });
        if let Some(previous) = self.logout_watch.lock().replace(watch) {
            previous.dispose();
        }

        info!("Sync engine started");
        Ok(())
    }

    /// Whether the engine was logged out by an expired credential.
    pub fn is_logged_out(&self) -> bool {
        self.logout.is_cancelled()
    }

    /// Reloads everything a session refresh does, now. `false` if a
    /// refresh was already running.
    ///
    /// # Errors
    ///
    /// Propagates exchange errors.
    pub async fn refresh_now(&self) -> Result<bool> {
        let session = self.components.clock.latest();
        self.refresher
            .refresh_all(session.as_ref(), Overlap::Skip)
            .await
    }

    /// Claims untracked deposits of one asset.
    ///
    /// # Errors
    ///
    /// See [`DepositReconciler::claim_now`]; unknown ledgers are
    /// [`BatchSyncError::Ineligible`].
    pub async fn claim_now(&self, ledger: &LedgerId) -> Result<NotifyResult> {
        let asset = self.asset(ledger)?;
        let result = self.reconciler.claim_now(&asset).await?;
        self.refresher.refresh_balances().await;
        Ok(result)
    }

    /// Claimable amounts of every asset, without side effects.
    pub async fn preview_claims(&self) -> Vec<ClaimPreview> {
        let assets: Vec<Asset> = self.shared.registry.read().iter().cloned().collect();
        self.reconciler.preview(&assets).await
    }

    /// Tracks a withdrawal submitted elsewhere in the application.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub fn notify_withdrawal(&self, block_index: u64) -> Result<()> {
        self.components.withdrawals.notify_withdrawal(block_index)
    }

    /// Validates and places a limit order. `price` is quote units per
    /// whole base token and `volume` base units.
    ///
    /// # Errors
    ///
    /// [`BatchSyncError::OrderRejected`] for validation failures, before
    /// any network call, or the exchange's error.
    pub async fn place_order(
        &self,
        ledger: &LedgerId,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<OrderId> {
        let started = Instant::now();
        let outcome = self.place_order_inner(ledger, side, price, volume).await;
        self.report_placement(&outcome, started);
        outcome
    }

    /// Places a limit order sized by quote value: the largest base volume
    /// at `price` worth a whole number of volume steps and no more than
    /// `quote_volume`.
    ///
    /// # Errors
    ///
    /// [`BatchSyncError::OrderRejected`] with
    /// [`StepOverflow`](orders::OrderValidationError::StepOverflow) when one
    /// step at `price` cannot be expressed in base units, plus everything
    /// [`place_order`](Self::place_order) returns.
    pub async fn place_quote_order(
        &self,
        ledger: &LedgerId,
        side: OrderSide,
        price: Decimal,
        quote_volume: Decimal,
    ) -> Result<OrderId> {
        let started = Instant::now();
        let outcome = self.place_quote_order_inner(ledger, side, price, quote_volume).await;
        self.report_placement(&outcome, started);
        outcome
    }

    async fn place_order_inner(
        &self,
        ledger: &LedgerId,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<OrderId> {
        let (settings, base, quote) = self.order_context(ledger).await?;
        let request = orders::validate_order(&settings, &base, &quote, side, price, volume)?;
        self.submit(&request).await
    }

    async fn place_quote_order_inner(
        &self,
        ledger: &LedgerId,
        side: OrderSide,
        price: Decimal,
        quote_volume: Decimal,
    ) -> Result<OrderId> {
        let (settings, base, quote) = self.order_context(ledger).await?;
        let volume = orders::volume_for_quote(&settings, &base, &quote, price, quote_volume)?;
        debug!(%quote_volume, %volume, "Sized order from quote value");
        let request = orders::validate_order(&settings, &base, &quote, side, price, volume)?;
        self.submit(&request).await
    }

    async fn submit(&self, request: &PlaceOrderRequest) -> Result<OrderId> {
        Ok(self.clients.exchange.place_order(request).await?.order_id)
    }

    fn report_placement(&self, outcome: &Result<OrderId>, started: Instant) {
        let elapsed = started.elapsed();
        match outcome {
            Ok(order_id) => {
                info!(%order_id, ?elapsed, "Order placed");
                self.notifier.emit(SyncEvent::OrderPlaced {
                    order_id: *order_id,
                    elapsed,
                });
            }
            Err(e) => {
                warn!(?elapsed, "Order failed: {e}");
                self.notifier.emit(SyncEvent::OrderFailed {
                    error: e.to_string(),
                    elapsed,
                });
            }
        }
    }

    /// Replaces an order in place with a new price and volume.
    ///
    /// # Errors
    ///
    /// Same as [`place_order`](Self::place_order).
    pub async fn replace_order(
        &self,
        order_id: OrderId,
        ledger: &LedgerId,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<OrderId> {
        let started = Instant::now();
        let outcome = self
            .replace_order_inner(order_id, ledger, side, price, volume)
            .await;
        self.report_placement(&outcome, started);
        outcome
    }

    async fn replace_order_inner(
        &self,
        order_id: OrderId,
        ledger: &LedgerId,
        side: OrderSide,
        price: Decimal,
        volume: Decimal,
    ) -> Result<OrderId> {
        let (settings, base, quote) = self.order_context(ledger).await?;
        let validated = orders::validate_order(&settings, &base, &quote, side, price, volume)?;
        let request = ReplaceOrderRequest {
            order_id,
            volume: validated.volume,
            price: validated.price,
        };
        Ok(self.clients.exchange.replace_order(&request).await?.order_id)
    }

    /// # Errors
    ///
    /// Propagates the exchange's error.
    pub async fn cancel_order(&self, order_id: OrderId) -> Result<()> {
        let started = Instant::now();
        let outcome = self.clients.exchange.cancel_order(order_id).await;
        let elapsed = started.elapsed();
        match &outcome {
            Ok(()) => self.notifier.emit(SyncEvent::OrderCancelled { order_id, elapsed }),
            Err(e) => self.notifier.emit(SyncEvent::OrderFailed {
                error: e.to_string(),
                elapsed,
            }),
        }
        outcome
    }

    /// Persists the auto-claim preference; the running claimer picks it up
    /// on its next preference poll.
    ///
    /// # Errors
    ///
    /// Returns [`BatchSyncError::Config`] for an unsupported interval.
    pub fn set_auto_claim_interval(&self, minutes: Option<u32>) -> Result<()> {
        deposit::save_auto_claim_interval(self.store.as_ref(), minutes)
    }

    /// # Errors
    ///
    /// Propagates store errors.
    pub fn auto_claim_interval(&self) -> Result<Option<u32>> {
        deposit::load_auto_claim_interval(self.store.as_ref())
    }

    pub fn assets(&self) -> AssetRegistry {
        self.shared.registry.read().clone()
    }

    pub fn balances(&self) -> BalanceSnapshot {
        self.shared.balances.read().clone()
    }

    pub fn settings(&self) -> Option<OrderSettings> {
        *self.shared.settings.read()
    }

    /// Orders waiting for a clearing, as of the last full refresh.
    pub fn open_orders(&self) -> Vec<OpenOrder> {
        self.shared.open_orders.read().clone()
    }

    /// Prices of the most recent clearing, per base asset.
    pub fn clearing_prices(&self) -> BTreeMap<LedgerId, Amount> {
        self.shared.clearing_prices.read().clone()
    }

    pub fn next_session(&self) -> Option<SessionDescriptor> {
        self.components.clock.latest()
    }

    pub fn scheduler_state(&self) -> Option<SchedulerState> {
        self.components.scheduler.lock().as_ref().map(SchedulerHandle::state)
    }

    pub fn utxo_snapshot(&self) -> Option<UtxoSnapshot> {
        self.components.utxo.as_ref().map(|u| u.snapshot())
    }

    /// # Errors
    ///
    /// Propagates store errors.
    pub fn pending_withdrawals(&self) -> Result<Vec<PendingWithdrawal>> {
        self.components.withdrawals.pending()
    }

    pub fn withdrawal_status(&self, block_index: u64) -> Option<WithdrawalStatus> {
        self.components.withdrawals.status(block_index)
    }

    /// # Errors
    ///
    /// Propagates store errors.
    pub fn last_claimed(&self, ledger: &LedgerId) -> Result<Option<LastClaimed>> {
        self.reconciler.last_claimed(ledger)
    }

    /// Stops every background task. Idempotent.
    pub fn dispose(&self) {
        if let Some(watch) = self.logout_watch.lock().take() {
            watch.dispose();
        }
        self.components.dispose();
        info!("Sync engine disposed");
    }

    fn asset(&self, ledger: &LedgerId) -> Result<Asset> {
        self.shared
            .registry
            .read()
            .get(ledger)
            .cloned()
            .ok_or_else(|| BatchSyncError::Ineligible(format!("unknown asset {ledger}")))
    }

    /// Settings, base asset and quote asset an order on `ledger` is
    /// validated against.
    async fn order_context(&self, ledger: &LedgerId) -> Result<(OrderSettings, Asset, Asset)> {
        let base = self.asset(ledger)?;
        let quote = self
            .shared
            .registry
            .read()
            .quote()
            .cloned()
            .ok_or_else(|| BatchSyncError::Ineligible("quote asset not loaded".into()))?;
        let settings = self.order_settings().await?;
        Ok((settings, base, quote))
    }

    async fn order_settings(&self) -> Result<OrderSettings> {
        let cached = *self.shared.settings.read();
        match cached {
            Some(settings) => Ok(settings),
            None => {
                let settings = self.clients.exchange.query_settings().await?;
                *self.shared.settings.write() = Some(settings);
                Ok(settings)
            }
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
