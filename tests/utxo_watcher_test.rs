//! Bitcoin deposit watcher against fake minter and block source.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use batchsync::bitcoin::{PollOutcome, UtxoWatcher};
use batchsync::clients::{BlockSource, MinterClient};
use batchsync::events::{Notifier, SyncEvent};
use batchsync::models::{UpdateBalanceStatus, UtxoStage};
use batchsync::store::{self, KvStore, MemoryStore, StoreKey};
use batchsync::timer::WallClock;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::assert_ok;

use common::{BTC_ADDRESS, USER, Venue, utxo};

fn watcher(venue: &Venue, store: &Arc<MemoryStore>) -> (Arc<UtxoWatcher>, UnboundedReceiver<SyncEvent>) {
    let (notifier, events) = Notifier::channel();
    let watcher = UtxoWatcher::new(
        BTC_ADDRESS,
        USER,
        Arc::clone(&venue.minter) as Arc<dyn MinterClient>,
        Arc::clone(&venue.blocks) as Arc<dyn BlockSource>,
        Arc::clone(store) as Arc<dyn KvStore>,
        Arc::clone(&venue.wall) as Arc<dyn WallClock>,
        notifier,
    );
    (watcher, events)
}

fn drain(events: &mut UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_new_deposit_is_announced_once() {
    let venue = Venue::new(60);
    let now = venue.wall.now();
    venue.blocks.state.lock().utxos = vec![utxo("aa", 25_000, 1, now, 120)];
    let store = Arc::new(MemoryStore::new());
    let (watcher, mut events) = watcher(&venue, &store);

    let first = assert_ok!(watcher.poll_once().await);
    assert_eq!(
        first,
        PollOutcome::Completed {
            detected: vec!["aa".into()],
            completed: vec![],
            balance_updated: false,
        }
    );
    let second = assert_ok!(watcher.poll_once().await);
    assert!(matches!(second, PollOutcome::Completed { ref detected, .. } if detected.is_empty()));

    let announced = drain(&mut events);
    assert_eq!(
        announced,
        vec![SyncEvent::DepositDetected {
            address: BTC_ADDRESS.into(),
            txid: "aa".into(),
            amount_sats: 25_000,
        }]
    );

    let snapshot = watcher.snapshot();
    assert_eq!(snapshot.outstanding.len(), 1);
    assert_eq!(snapshot.outstanding[0].1, UtxoStage::Confirmed);
}

#[tokio::test]
async fn test_seen_sets_survive_a_restart() {
    let venue = Venue::new(60);
    let now = venue.wall.now();
    venue.blocks.state.lock().utxos = vec![utxo("aa", 25_000, 0, now, 0)];
    let store = Arc::new(MemoryStore::new());

    let (first, mut first_events) = watcher(&venue, &store);
    assert_ok!(first.poll_once().await);
    assert_eq!(drain(&mut first_events).len(), 1);
    drop(first);

    let (second, mut second_events) = watcher(&venue, &store);
    assert_ok!(second.poll_once().await);
    assert!(drain(&mut second_events).is_empty());
}

#[tokio::test]
async fn test_matured_deposit_is_swept_and_completed() {
    let venue = Venue::new(60);
    let now = venue.wall.now();
    let matured = utxo("bb", 80_000, 6, now, 3_600);
    venue.blocks.state.lock().utxos = vec![matured.clone()];
    venue.minter.state.lock().sweepable = vec![matured];
    let store = Arc::new(MemoryStore::new());
    let (watcher, mut events) = watcher(&venue, &store);

    let outcome = assert_ok!(watcher.poll_once().await);
    assert!(matches!(outcome, PollOutcome::Completed { balance_updated: true, .. }));
    assert_eq!(venue.minter.state.lock().update_calls, 1);
    assert_eq!(watcher.snapshot().swept.len(), 1);
    assert!(watcher.snapshot().outstanding.is_empty());
    drain(&mut events);

    // The minter now knows the UTXO: completed once, pending pruned.
    let outcome = assert_ok!(watcher.poll_once().await);
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            detected: vec![],
            completed: vec!["bb".into()],
            balance_updated: false,
        }
    );
    assert_eq!(
        drain(&mut events),
        vec![SyncEvent::DepositCompleted {
            address: BTC_ADDRESS.into(),
            txid: "bb".into(),
            amount_sats: 80_000,
        }]
    );
    let pending: BTreeSet<String> = assert_ok!(store::load_json(
        store.as_ref(),
        &StoreKey::seen_utxos_pending(BTC_ADDRESS)
    ))
    .unwrap_or_default();
    assert!(pending.is_empty());
    assert_eq!(venue.minter.state.lock().update_calls, 1);
}

#[tokio::test]
async fn test_refused_deposit_is_not_offered_again() {
    let venue = Venue::new(60);
    let now = venue.wall.now();
    venue.blocks.state.lock().utxos = vec![utxo("dd", 500, 6, now, 3_600)];
    venue.minter.state.lock().rejections =
        vec![UpdateBalanceStatus::ValueTooSmall { txid: "dd".into() }];
    let store = Arc::new(MemoryStore::new());

    let (first, _events) = watcher(&venue, &store);
    let outcome = assert_ok!(first.poll_once().await);
    assert!(matches!(outcome, PollOutcome::Completed { balance_updated: true, .. }));
    let outcome = assert_ok!(first.poll_once().await);
    assert!(matches!(outcome, PollOutcome::Completed { balance_updated: false, .. }));
    assert_eq!(venue.minter.state.lock().update_calls, 1);
    drop(first);

    let rejected: Option<BTreeSet<String>> = assert_ok!(store::load_json(
        store.as_ref(),
        &StoreKey::seen_utxos_rejected(BTC_ADDRESS)
    ));
    assert_eq!(rejected, Some(BTreeSet::from(["dd".to_string()])));

    let (second, _events) = watcher(&venue, &store);
    assert_ok!(second.poll_once().await);
    assert_eq!(venue.minter.state.lock().update_calls, 1);
}

#[tokio::test]
async fn test_young_deposit_does_not_trigger_balance_update() {
    let venue = Venue::new(60);
    let now = venue.wall.now();
    // Deep enough but mined moments ago.
    venue.blocks.state.lock().utxos = vec![utxo("cc", 30_000, 6, now, 10)];
    let store = Arc::new(MemoryStore::new());
    let (watcher, _events) = watcher(&venue, &store);

    let outcome = assert_ok!(watcher.poll_once().await);
    assert!(matches!(outcome, PollOutcome::Completed { balance_updated: false, .. }));
    assert_eq!(venue.minter.state.lock().update_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_poll_is_skipped() {
    let venue = Venue::new(60);
    venue.blocks.state.lock().delay = Some(Duration::from_secs(5));
    let store = Arc::new(MemoryStore::new());
    let (watcher, _events) = watcher(&venue, &store);

    let (first, second) = tokio::join!(watcher.poll_once(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        watcher.poll_once().await
    });
    assert!(matches!(assert_ok!(first), PollOutcome::Completed { .. }));
    assert_eq!(assert_ok!(second), PollOutcome::Skipped);
    assert_eq!(venue.blocks.state.lock().list_calls, 1);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_watcher_polls_every_thirty_seconds() {
    let venue = Venue::new(60);
    let store = Arc::new(MemoryStore::new());
    let (watcher, _events) = watcher(&venue, &store);

    watcher.spawn();
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(venue.blocks.state.lock().list_calls, 3);

    watcher.dispose();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(venue.blocks.state.lock().list_calls, 3);
}
