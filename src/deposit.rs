//! Deposit reconciliation.
//!
//! Users fund their exchange account by transferring tokens to a deposit
//! subaccount the exchange owns. The exchange only credits what it has
//! been told about, so the difference between the subaccount's ledger
//! balance and the exchange's tracked deposit is money waiting to be
//! claimed with a `notify_deposit` call.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clients::{ExchangeClient, LedgerClient};
use crate::events::{Notifier, SyncEvent};
use crate::fixed_point::Amount;
use crate::models::{Account, Asset, AssetRegistry, LedgerId, NotifyResult};
use crate::store::{self, KvStore, StoreKey};
use crate::timer::TimerSlot;
use crate::{BatchSyncError, Result};

/// Auto-claim intervals a user may choose, in minutes.
pub const AUTO_CLAIM_INTERVALS_MINUTES: [u32; 4] = [5, 10, 30, 60];

/// How often the persisted auto-claim preference is re-read.
pub const PREFERENCE_POLL_PERIOD: Duration = Duration::from_secs(30);

/// Outcome of comparing a ledger balance with the tracked deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claimable {
    /// `ledger_balance - tracked`.
    Available(Amount),
    /// The exchange tracks more than the ledger holds. This happens when a
    /// claim races a balance read; it is shown as zero.
    Clamped { ledger_balance: Amount, tracked: Amount },
    /// A read failed or returned malformed data. Unknown, not zero.
    Unavailable(String),
}

impl Claimable {
    /// Amount to show the user: `None` when unknown.
    pub fn amount(&self) -> Option<Amount> {
        match self {
            Self::Available(amount) => Some(*amount),
            Self::Clamped { .. } => Some(Amount::ZERO),
            Self::Unavailable(_) => None,
        }
    }

    /// Claiming costs `fee`; only strictly larger amounts are worth it.
    pub fn exceeds_fee(&self, fee: Amount) -> bool {
        matches!(self, Self::Available(amount) if *amount > fee)
    }
}

/// Claimable state of one asset, for previews.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPreview {
    pub ledger: LedgerId,
    pub symbol: String,
    pub claimable: Claimable,
    /// Exact display string, `None` when unavailable.
    pub display: Option<String>,
    pub eligible: bool,
}

/// Result of one auto-claim pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimReport {
    pub claimed: Vec<(LedgerId, NotifyResult)>,
    /// Below fee, clamped or unavailable. Not failures.
    pub ineligible: Vec<LedgerId>,
    /// Skipped because a claim for the asset was already running.
    pub in_flight: Vec<LedgerId>,
    pub failed: Vec<(LedgerId, String)>,
}

/// Last successful claim of an asset, persisted for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastClaimed {
    pub amount: Amount,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

enum AssetOutcome {
    Claimed(LedgerId, NotifyResult),
    Ineligible(LedgerId),
    InFlight(LedgerId),
    Failed(LedgerId, String),
}

/// Releases the in-flight slot for a ledger on drop.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<LedgerId>>,
    ledger: LedgerId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.ledger);
    }
}

/// Computes and claims untracked deposits for one user.
pub struct DepositReconciler {
    exchange: Arc<dyn ExchangeClient>,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn KvStore>,
    notifier: Notifier,
    deposit_account: Account,
    in_flight: Mutex<HashSet<LedgerId>>,
}

impl DepositReconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn KvStore>,
        notifier: Notifier,
        user: &str,
    ) -> Self {
        let deposit_account = Account::deposit_account(exchange.principal(), user);
        Self {
            exchange,
            ledger,
            store,
            notifier,
            deposit_account,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn deposit_account(&self) -> &Account {
        &self.deposit_account
    }

    /// Reads the deposit subaccount balance and the tracked deposit
    /// concurrently and compares them.
    pub async fn compute_claimable(&self, asset: &Asset) -> Claimable {
        let (balance, tracked) = tokio::join!(
            self.ledger.balance_of(&asset.ledger, &self.deposit_account),
            self.exchange.query_tracked_deposit(&asset.ledger),
        );

        match (balance, tracked) {
            (Ok(ledger_balance), Ok(tracked)) => match ledger_balance.checked_sub(tracked) {
                Some(available) => Claimable::Available(available),
                None => {
                    warn!(
                        asset = %asset.symbol,
                        %ledger_balance,
                        %tracked,
                        "Tracked deposit exceeds ledger balance, treating as zero"
                    );
                    Claimable::Clamped {
                        ledger_balance,
                        tracked,
                    }
                }
            },
            (Err(e), _) => Claimable::Unavailable(format!("ledger balance: {e}")),
            (_, Err(e)) => Claimable::Unavailable(format!("tracked deposit: {e}")),
        }
    }

    /// Claimable state of every asset, without side effects.
    pub async fn preview(&self, assets: &[Asset]) -> Vec<ClaimPreview> {
        join_all(assets.iter().map(|asset| async move {
            let claimable = self.compute_claimable(asset).await;
            ClaimPreview {
                ledger: asset.ledger.clone(),
                symbol: asset.symbol.clone(),
                display: claimable.amount().map(|a| asset.format(a)),
                eligible: claimable.exceeds_fee(asset.fee),
                claimable,
            }
        }))
        .await
    }

    /// Notifies the exchange for every asset whose claimable amount exceeds
    /// its fee. Failures are logged, never surfaced as events.
    pub async fn auto_claim(&self, assets: &[Asset]) -> ClaimReport {
        let outcomes = join_all(assets.iter().map(|asset| self.auto_claim_one(asset))).await;

        let mut report = ClaimReport::default();
        for outcome in outcomes {
            match outcome {
                AssetOutcome::Claimed(ledger, result) => report.claimed.push((ledger, result)),
                AssetOutcome::Ineligible(ledger) => report.ineligible.push(ledger),
                AssetOutcome::InFlight(ledger) => report.in_flight.push(ledger),
                AssetOutcome::Failed(ledger, error) => report.failed.push((ledger, error)),
            }
        }
        debug!(
            claimed = report.claimed.len(),
            ineligible = report.ineligible.len(),
            in_flight = report.in_flight.len(),
            failed = report.failed.len(),
            "Auto-claim pass finished"
        );
        report
    }

    async fn auto_claim_one(&self, asset: &Asset) -> AssetOutcome {
        let ledger = asset.ledger.clone();
        let Some(_guard) = self.begin(&ledger) else {
            return AssetOutcome::InFlight(ledger);
        };

        let claimable = self.compute_claimable(asset).await;
        if !claimable.exceeds_fee(asset.fee) {
            if let Claimable::Unavailable(reason) = &claimable {
                debug!(asset = %asset.symbol, reason, "Claimable amount unavailable");
            }
            return AssetOutcome::Ineligible(ledger);
        }

        match self.exchange.notify_deposit(&ledger).await {
            Ok(result) => {
                info!(
                    asset = %asset.symbol,
                    credited = %asset.format(result.credit_increase),
                    "Auto-claimed deposit"
                );
                self.record_claim(&ledger, result);
                AssetOutcome::Claimed(ledger, result)
            }
            Err(e) => {
                warn!(asset = %asset.symbol, "Auto-claim failed: {e}");
                AssetOutcome::Failed(ledger, e.to_string())
            }
        }
    }

    /// User-initiated claim. Always emits a success or failure event with
    /// the elapsed time.
    ///
    /// # Errors
    ///
    /// - [`BatchSyncError::Busy`] if a claim for the asset is running
    /// - [`BatchSyncError::Ineligible`] if the claimable amount does not
    ///   exceed the fee or is unknown
    /// - any error from the exchange's notify call
    pub async fn claim_now(&self, asset: &Asset) -> Result<NotifyResult> {
        let started = Instant::now();
        let outcome = self.claim_now_inner(asset).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok((claimed, result)) => {
                info!(asset = %asset.symbol, ?elapsed, "Claim succeeded");
                self.notifier.emit(SyncEvent::ClaimSucceeded {
                    ledger: asset.ledger.clone(),
                    symbol: asset.symbol.clone(),
                    claimed: *claimed,
                    result: *result,
                    elapsed,
                });
            }
            Err(e) => {
                warn!(asset = %asset.symbol, ?elapsed, "Claim failed: {e}");
                self.notifier.emit(SyncEvent::ClaimFailed {
                    ledger: asset.ledger.clone(),
                    symbol: asset.symbol.clone(),
                    error: e.to_string(),
                    elapsed,
                });
            }
        }
        outcome.map(|(_, result)| result)
    }

    async fn claim_now_inner(&self, asset: &Asset) -> Result<(Amount, NotifyResult)> {
        let _guard = self
            .begin(&asset.ledger)
            .ok_or_else(|| BatchSyncError::Busy(format!("claim {}", asset.symbol)))?;

        let claimed = match self.compute_claimable(asset).await {
            Claimable::Unavailable(reason) => return Err(BatchSyncError::Ineligible(reason)),
            c if !c.exceeds_fee(asset.fee) => {
                return Err(BatchSyncError::Ineligible(format!(
                    "{} claimable does not exceed fee {}",
                    asset.format(c.amount().unwrap_or_default()),
                    asset.format(asset.fee)
                )));
            }
            c => c.amount().unwrap_or_default(),
        };

        let result = self.exchange.notify_deposit(&asset.ledger).await?;
        self.record_claim(&asset.ledger, result);
        Ok((claimed, result))
    }

    /// Last successful claim of `ledger`, read fresh from the store.
    ///
    /// # Errors
    ///
    /// Propagates store and JSON errors.
    pub fn last_claimed(&self, ledger: &LedgerId) -> Result<Option<LastClaimed>> {
        store::load_json(self.store.as_ref(), &StoreKey::last_claimed(ledger))
    }

    fn record_claim(&self, ledger: &LedgerId, result: NotifyResult) {
        let record = LastClaimed {
            amount: result.credit_increase,
            at: Utc::now(),
        };
        if let Err(e) = store::save_json(self.store.as_ref(), &StoreKey::last_claimed(ledger), &record) {
            warn!(%ledger, "Failed to persist last claim: {e}");
        }
    }

    fn begin(&self, ledger: &LedgerId) -> Option<InFlightGuard<'_>> {
        if !self.in_flight.lock().insert(ledger.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            ledger: ledger.clone(),
        })
    }
}

/// Reads the persisted auto-claim interval. Missing means disabled.
///
/// # Errors
///
/// Propagates store and JSON errors.
pub fn load_auto_claim_interval(store: &dyn KvStore) -> Result<Option<u32>> {
    Ok(store::load_json::<Option<u32>>(store, &StoreKey::auto_claim_interval())?.flatten())
}

/// Persists the auto-claim interval; `None` disables auto-claiming.
///
/// # Errors
///
/// Returns [`BatchSyncError::Config`] for an interval outside
/// [`AUTO_CLAIM_INTERVALS_MINUTES`], or a store error.
pub fn save_auto_claim_interval(store: &dyn KvStore, minutes: Option<u32>) -> Result<()> {
    if let Some(m) = minutes
        && !AUTO_CLAIM_INTERVALS_MINUTES.contains(&m)
    {
        return Err(BatchSyncError::Config(format!(
            "auto-claim interval must be one of {AUTO_CLAIM_INTERVALS_MINUTES:?} minutes, got {m}"
        )));
    }
    store::save_json(store, &StoreKey::auto_claim_interval(), &minutes)
}

/// Runs [`DepositReconciler::auto_claim`] on the user's chosen interval.
pub struct AutoClaimer {
    reconciler: Arc<DepositReconciler>,
    registry: Arc<RwLock<AssetRegistry>>,
    store: Arc<dyn KvStore>,
    current: Mutex<Option<u32>>,
    preference: TimerSlot,
    claims: TimerSlot,
}

impl AutoClaimer {
    pub fn new(
        reconciler: Arc<DepositReconciler>,
        registry: Arc<RwLock<AssetRegistry>>,
        store: Arc<dyn KvStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            registry,
            store,
            current: Mutex::new(None),
            preference: TimerSlot::new("auto-claim-preference"),
            claims: TimerSlot::new("auto-claim"),
        })
    }

    /// Applies the persisted preference now and re-reads it every
    /// [`PREFERENCE_POLL_PERIOD`].
    pub fn start(self: &Arc<Self>) {
        self.apply_preference();
        let weak = Arc::downgrade(self);
        self.preference.arm_repeating(PREFERENCE_POLL_PERIOD, move || {
            let weak = Weak::clone(&weak);
            async move {
                match weak.upgrade() {
                    Some(this) => {
                        this.apply_preference();
                        std::ops::ControlFlow::Continue(())
                    }
                    None => std::ops::ControlFlow::Break(()),
                }
            }
        });
    }

    /// Interval currently in effect.
    pub fn active_interval(&self) -> Option<u32> {
        *self.current.lock()
    }

    pub fn is_claiming(&self) -> bool {
        self.claims.is_armed()
    }

    fn apply_preference(&self) {
        let wanted = match load_auto_claim_interval(self.store.as_ref()) {
            Ok(Some(m)) if AUTO_CLAIM_INTERVALS_MINUTES.contains(&m) => Some(m),
            Ok(Some(m)) => {
                warn!(minutes = m, "Ignoring unsupported auto-claim interval");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read auto-claim interval: {e}");
                return;
            }
        };

        let mut current = self.current.lock();
        if *current == wanted {
            return;
        }
        *current = wanted;

        match wanted {
            Some(minutes) => {
                info!(minutes, "Auto-claim enabled");
                let reconciler = Arc::clone(&self.reconciler);
                let registry = Arc::clone(&self.registry);
                self.claims
                    .arm_repeating(Duration::from_secs(u64::from(minutes) * 60), move || {
                        let reconciler = Arc::clone(&reconciler);
                        let assets: Vec<Asset> = registry.read().iter().cloned().collect();
                        async move {
                            reconciler.auto_claim(&assets).await;
                            std::ops::ControlFlow::Continue(())
                        }
                    });
            }
            None => {
                info!("Auto-claim disabled");
                self.claims.dispose();
            }
        }
    }

    pub fn dispose(&self) {
        self.preference.dispose();
        self.claims.dispose();
        *self.current.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn claimable_amounts() {
        assert_eq!(Claimable::Available(Amount(5)).amount(), Some(Amount(5)));
        let clamped = Claimable::Clamped {
            ledger_balance: Amount(1),
            tracked: Amount(2),
        };
        assert_eq!(clamped.amount(), Some(Amount::ZERO));
        assert!(!clamped.exceeds_fee(Amount::ZERO));
        assert_eq!(Claimable::Unavailable("down".into()).amount(), None);
    }

    #[test]
    fn fee_threshold_is_strict() {
        assert!(Claimable::Available(Amount(10_001)).exceeds_fee(Amount(10_000)));
        assert!(!Claimable::Available(Amount(10_000)).exceeds_fee(Amount(10_000)));
    }

    #[test]
    fn interval_preference_round_trips_and_validates() {
        let store = MemoryStore::new();
        assert_eq!(load_auto_claim_interval(&store).unwrap(), None);

        save_auto_claim_interval(&store, Some(30)).unwrap();
        assert_eq!(load_auto_claim_interval(&store).unwrap(), Some(30));

        assert!(save_auto_claim_interval(&store, Some(7)).is_err());
        assert_eq!(load_auto_claim_interval(&store).unwrap(), Some(30));

        save_auto_claim_interval(&store, None).unwrap();
        assert_eq!(load_auto_claim_interval(&store).unwrap(), None);
    }
}
