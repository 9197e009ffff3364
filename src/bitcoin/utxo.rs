//! Bitcoin deposit watcher.
//!
//! Follows UTXOs paying the user's deposit address from first sighting to
//! the minter sweeping them. Two persisted txid sets per address make
//! every notification fire once, across restarts:
//! - `pending`: seen on chain, announced as detected
//! - `finalized`: known to the minter, announced as completed
//!
//! A third set, `rejected`, holds matured UTXOs the minter refused so they
//! do not trigger a balance update on every cycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::Result;
use crate::clients::{BlockSource, MinterClient};
use crate::events::{Notifier, SyncEvent};
use crate::models::{UpdateBalanceStatus, Utxo, UtxoStage};
use crate::store::{self, KvStore, StoreKey};
use crate::timer::{TimerSlot, WallClock};

/// Poll period of the watcher.
pub const UTXO_POLL_PERIOD: Duration = Duration::from_secs(30);

/// What a single poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another poll was still running.
    Skipped,
    Completed {
        /// Txids announced as new deposits.
        detected: Vec<String>,
        /// Txids announced as swept by the minter.
        completed: Vec<String>,
        /// Whether the minter was asked to sweep matured UTXOs.
        balance_updated: bool,
    },
}

/// Classified view of the deposit address for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSnapshot {
    /// On-chain UTXOs not yet swept, with their stage.
    pub outstanding: Vec<(Utxo, UtxoStage)>,
    /// UTXOs the minter has swept.
    pub swept: Vec<Utxo>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Clears the in-flight flag on drop.
struct PollGuard<'a>(&'a AtomicBool);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct UtxoWatcher {
    address: String,
    owner: String,
    minter: Arc<dyn MinterClient>,
    source: Arc<dyn BlockSource>,
    store: Arc<dyn KvStore>,
    wall: Arc<dyn WallClock>,
    notifier: Notifier,
    polling: AtomicBool,
    snapshot: RwLock<UtxoSnapshot>,
    slot: TimerSlot,
}

impl UtxoWatcher {
    /// `address` is the Bitcoin deposit address, `owner` the principal the
    /// minter credits.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: impl Into<String>,
        owner: impl Into<String>,
        minter: Arc<dyn MinterClient>,
        source: Arc<dyn BlockSource>,
        store: Arc<dyn KvStore>,
        wall: Arc<dyn WallClock>,
        notifier: Notifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            owner: owner.into(),
            minter,
            source,
            store,
            wall,
            notifier,
            polling: AtomicBool::new(false),
            snapshot: RwLock::new(UtxoSnapshot::default()),
            slot: TimerSlot::new("utxo-watcher"),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn snapshot(&self) -> UtxoSnapshot {
        self.snapshot.read().clone()
    }

    /// Polls now and then every [`UTXO_POLL_PERIOD`] until disposed.
    pub fn spawn(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.slot
            .arm_repeating_after(Duration::ZERO, UTXO_POLL_PERIOD, move || {
                let weak = weak.clone();
                async move {
                    let Some(this) = weak.upgrade() else {
                        return std::ops::ControlFlow::Break(());
                    };
                    if let Err(e) = this.poll_once().await {
                        warn!(address = %this.address, "UTXO poll failed: {e}");
                    }
                    std::ops::ControlFlow::Continue(())
                }
            });
    }

    pub fn dispose(&self) {
        self.slot.dispose();
    }

    /// One watch cycle. Overlapping calls return [`PollOutcome::Skipped`].
    ///
    /// # Errors
    ///
    /// Any collaborator or store error abandons the cycle; sets are only
    /// written after the fetch they depend on succeeded.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        if self
            .polling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(address = %self.address, "UTXO poll already running");
            return Ok(PollOutcome::Skipped);
        }
        let _guard = PollGuard(&self.polling);

        // 1. Swept by the minter
        let mut known = self.minter.list_known_utxos(&self.owner).await?;
        let finalized_key = StoreKey::seen_utxos_finalized(&self.address);
        let mut finalized = self.load_set(&finalized_key)?;
        let mut completed = Vec::new();
        for utxo in &known {
            if finalized.insert(utxo.txid.clone()) {
                info!(txid = %utxo.txid, amount = utxo.amount, "Deposit swept by minter");
                self.notifier.emit(SyncEvent::DepositCompleted {
                    address: self.address.clone(),
                    txid: utxo.txid.clone(),
                    amount_sats: utxo.amount,
                });
                completed.push(utxo.txid.clone());
            }
        }
        if !completed.is_empty() {
            store::save_json(self.store.as_ref(), &finalized_key, &finalized)?;
        }

        // 2. Seen on chain
        let on_chain = self.source.list_utxos(&self.address).await?;
        let pending_key = StoreKey::seen_utxos_pending(&self.address);
        let mut pending = self.load_set(&pending_key)?;
        let mut detected = Vec::new();
        for utxo in &on_chain {
            if finalized.contains(&utxo.txid) || pending.contains(&utxo.txid) {
                continue;
            }
            pending.insert(utxo.txid.clone());
            info!(txid = %utxo.txid, amount = utxo.amount, "New deposit detected");
            self.notifier.emit(SyncEvent::DepositDetected {
                address: self.address.clone(),
                txid: utxo.txid.clone(),
                amount_sats: utxo.amount,
            });
            detected.push(utxo.txid.clone());
        }
        let before = pending.len();
        pending.retain(|txid| !finalized.contains(txid));
        if !detected.is_empty() || pending.len() != before {
            store::save_json(self.store.as_ref(), &pending_key, &pending)?;
        }

        // 3. Ask the minter to sweep matured outputs
        let now = self.wall.now();
        let rejected_key = StoreKey::seen_utxos_rejected(&self.address);
        let mut rejected = self.load_set(&rejected_key)?;
        let matured = on_chain
            .iter()
            .filter(|u| {
                !finalized.contains(&u.txid)
                    && !rejected.contains(&u.txid)
                    && u.stage(now) == UtxoStage::Matured
            })
            .count();
        let balance_updated = matured > 0;
        if balance_updated {
            let statuses = self.minter.update_balance(&self.owner).await?;
            let mut newly_rejected = false;
            for status in &statuses {
                log_update_status(status);
                if let UpdateBalanceStatus::ValueTooSmall { txid }
                | UpdateBalanceStatus::Tainted { txid } = status
                {
                    newly_rejected |= rejected.insert(txid.clone());
                }
            }
            if newly_rejected {
                store::save_json(self.store.as_ref(), &rejected_key, &rejected)?;
            }
            known = self.minter.list_known_utxos(&self.owner).await?;
        }

        let swept: BTreeSet<&str> = known.iter().map(|u| u.txid.as_str()).collect();
        *self.snapshot.write() = UtxoSnapshot {
            outstanding: on_chain
                .iter()
                .filter(|u| !swept.contains(u.txid.as_str()))
                .map(|u| (u.clone(), u.stage(now)))
                .collect(),
            swept: known,
            updated_at: Some(now),
        };

        Ok(PollOutcome::Completed {
            detected,
            completed,
            balance_updated,
        })
    }

    fn load_set(&self, key: &StoreKey) -> Result<BTreeSet<String>> {
        Ok(store::load_json(self.store.as_ref(), key)?.unwrap_or_default())
    }
}

fn log_update_status(status: &UpdateBalanceStatus) {
    match status {
        UpdateBalanceStatus::Minted {
            txid,
            block_index,
            minted_amount,
        } => info!(%txid, block_index, minted_amount, "Minter minted deposit"),
        UpdateBalanceStatus::Checked { txid } => debug!(%txid, "Minter checked deposit"),
        UpdateBalanceStatus::ValueTooSmall { txid } => {
            warn!(%txid, "Deposit below minter minimum")
        }
        UpdateBalanceStatus::Tainted { txid } => warn!(%txid, "Deposit rejected as tainted"),
    }
}
