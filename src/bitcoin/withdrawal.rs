//! Withdrawal status poller.
//!
//! A withdrawal is persisted by block index as soon as it is submitted and
//! tracked until the minter reports a terminal status. The poller only
//! runs while the persisted list is non-empty.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::Result;
use crate::clients::MinterClient;
use crate::events::{Notifier, SyncEvent};
use crate::models::{PendingWithdrawal, WithdrawalStatus};
use crate::store::{self, KvStore, StoreKey};
use crate::timer::TimerSlot;

/// Poll period while withdrawals are outstanding.
pub const WITHDRAWAL_POLL_PERIOD: Duration = Duration::from_secs(30);

/// Something that can reload balances after funds leave the account.
#[async_trait]
pub trait BalanceRefresher: Send + Sync {
    async fn refresh_balances(&self);
}

/// What a single poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WithdrawalPollReport {
    /// Block indices whose status changed.
    pub changed: Vec<u64>,
    /// Block indices that reached a terminal status and were removed.
    pub finalized: Vec<u64>,
    /// Block indices whose status could not be fetched this cycle.
    pub failed: Vec<u64>,
    /// Entries still persisted after the poll.
    pub remaining: usize,
}

pub struct WithdrawalPoller {
    minter: Arc<dyn MinterClient>,
    store: Arc<dyn KvStore>,
    notifier: Notifier,
    refresher: Arc<dyn BalanceRefresher>,
    last_seen: Mutex<HashMap<u64, WithdrawalStatus>>,
    /// Set while the poll loop is meant to run. Starting and stopping both
    /// hold this lock so an entry persisted while the loop winds down is
    /// never left unpolled.
    running: Mutex<bool>,
    slot: TimerSlot,
}

impl WithdrawalPoller {
    pub fn new(
        minter: Arc<dyn MinterClient>,
        store: Arc<dyn KvStore>,
        notifier: Notifier,
        refresher: Arc<dyn BalanceRefresher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            minter,
            store,
            notifier,
            refresher,
            last_seen: Mutex::new(HashMap::new()),
            running: Mutex::new(false),
            slot: TimerSlot::new("withdrawal-poller"),
        })
    }

    /// Persisted withdrawals, read fresh.
    ///
    /// # Errors
    ///
    /// Propagates store and JSON errors.
    pub fn pending(&self) -> Result<Vec<PendingWithdrawal>> {
        Ok(store::load_json(self.store.as_ref(), &StoreKey::pending_withdrawals())?.unwrap_or_default())
    }

    /// Last status seen for `block_index` in this process.
    pub fn status(&self, block_index: u64) -> Option<WithdrawalStatus> {
        self.last_seen.lock().get(&block_index).cloned()
    }

    pub fn is_running(&self) -> bool {
        self.slot.is_armed()
    }

    /// Records a submitted withdrawal and makes sure the poller runs.
    ///
    /// # Errors
    ///
    /// Propagates store and JSON errors.
    pub fn notify_withdrawal(self: &Arc<Self>, block_index: u64) -> Result<()> {
        let mut pending = self.pending()?;
        if pending.iter().any(|w| w.block_index == block_index) {
            debug!(block_index, "Withdrawal already tracked");
        } else {
            pending.push(PendingWithdrawal { block_index });
            store::save_json(self.store.as_ref(), &StoreKey::pending_withdrawals(), &pending)?;
            info!(block_index, "Tracking withdrawal");
        }
        self.ensure_running();
        Ok(())
    }

    /// Starts polling if anything is persisted. Called at login.
    ///
    /// # Errors
    ///
    /// Propagates store and JSON errors.
    pub fn start_if_pending(self: &Arc<Self>) -> Result<bool> {
        let has_pending = !self.pending()?.is_empty();
        if has_pending {
            self.ensure_running();
        }
        Ok(has_pending)
    }

    pub fn dispose(&self) {
        let mut running = self.running.lock();
        *running = false;
        self.slot.dispose();
    }

    fn ensure_running(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if *running && self.slot.is_armed() {
            return;
        }
        *running = true;
        let weak = Arc::downgrade(self);
        self.slot
            .arm_repeating_after(Duration::ZERO, WITHDRAWAL_POLL_PERIOD, move || {
                let weak = weak.clone();
                async move {
                    let Some(this) = weak.upgrade() else {
                        return ControlFlow::Break(());
                    };
                    match this.poll_once().await {
                        Ok(report) if report.remaining == 0 => this.stop_if_idle(),
                        Ok(_) => ControlFlow::Continue(()),
                        Err(e) => {
                            warn!("Withdrawal poll failed: {e}");
                            ControlFlow::Continue(())
                        }
                    }
                }
            });
    }

    /// Ends the poll loop unless a withdrawal was persisted since the last
    /// poll read the list.
    fn stop_if_idle(&self) -> ControlFlow<()> {
        let mut running = self.running.lock();
        match self.pending() {
            Ok(pending) if pending.is_empty() => {
                debug!("No withdrawals left, stopping poller");
                *running = false;
                ControlFlow::Break(())
            }
            Ok(_) => ControlFlow::Continue(()),
            Err(e) => {
                warn!("Failed to re-read pending withdrawals: {e}");
                ControlFlow::Continue(())
            }
        }
    }

    /// Checks every persisted withdrawal once.
    ///
    /// # Errors
    ///
    /// Returns store errors. A failed status fetch only skips that entry.
    pub async fn poll_once(&self) -> Result<WithdrawalPollReport> {
        let mut report = WithdrawalPollReport::default();

        for entry in self.pending()? {
            let index = entry.block_index;
            let status = match self.minter.withdrawal_status(index).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(block_index = index, "Failed to fetch withdrawal status: {e}");
                    report.failed.push(index);
                    continue;
                }
            };

            let changed = self.last_seen.lock().insert(index, status.clone()).as_ref() != Some(&status);
            if changed {
                info!(block_index = index, status = status.label(), "Withdrawal status changed");
                self.notifier.emit(SyncEvent::WithdrawalStatusChanged {
                    block_index: index,
                    status: status.clone(),
                });
                report.changed.push(index);
            }

            if status.is_terminal() {
                self.remove(index)?;
                self.last_seen.lock().remove(&index);
                self.notifier.emit(SyncEvent::WithdrawalFinalized {
                    block_index: index,
                    status,
                });
                report.finalized.push(index);
            }
        }

        if !report.finalized.is_empty() {
            self.refresher.refresh_balances().await;
        }
        report.remaining = self.pending()?.len();
        Ok(report)
    }

    /// Read-then-write removal so entries added meanwhile survive.
    fn remove(&self, block_index: u64) -> Result<()> {
        let mut pending = self.pending()?;
        pending.retain(|w| w.block_index != block_index);
        store::save_json(self.store.as_ref(), &StoreKey::pending_withdrawals(), &pending)
    }
}
