//! Integration test: dispute detection, recovery and conclusion.
//!
//! After a channel is open, states registered on either ledger are checked
//! against the latest agreed state by each party's watcher.

use std::sync::Arc;
use std::time::Duration;

use xchannel_client::{ChannelHandle, ClientError, LocalBus};
use xchannel_core::{ChannelPhase, ChannelState};
use xchannel_integration_tests::{
    allocation, asset_a, asset_b, party, settle, spawn_party, Backend, FlakyAdjudicator, Ledgers,
    TestParty,
};
use xchannel_ledger::Adjudicator;

/// Open a channel from alice to bob on the shared ledgers.
async fn open(ledgers: &Ledgers) -> (TestParty, TestParty, Arc<ChannelHandle>, Arc<ChannelHandle>) {
    let bus = Arc::new(LocalBus::new());
    let alice = spawn_party("alice", &bus, ledgers.backends()).expect("alice");
    let bob = spawn_party("bob", &bus, ledgers.backends()).expect("bob");
    let handle = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect("open should succeed");
    let accepted = bob
        .coordinator
        .accepted_channel()
        .await
        .expect("bob should receive the channel");
    (alice, bob, handle, accepted)
}

/// Advance a handle's agreed state by one version.
fn advance(handle: &ChannelHandle) -> ChannelState {
    let mut next = handle.state();
    next.version += 1;
    next.allocation
        .set_asset_balances(&asset_b(), vec![10, 40])
        .expect("asset B in allocation");
    handle.apply_update(next.clone()).expect("update applies");
    next
}

async fn wait_phase(handle: &ChannelHandle, phase: ChannelPhase) -> ChannelPhase {
    tokio::time::timeout(
        Duration::from_secs(2),
        handle.wait_for_phase(|p| p == phase),
    )
    .await
    .expect("phase reached in time")
}

// =========================================================================
// Divergent registration
// =========================================================================

#[tokio::test]
async fn test_divergent_registration_disputes_and_recovers_once() {
    let ledgers = Ledgers::new();
    let (alice, bob, handle, accepted) = open(&ledgers).await;

    // Both parties agree on version 1.
    let agreed = advance(&handle);
    accepted.apply_update(agreed.clone()).expect("bob update");

    // An outdated version 0 gets registered for asset A.
    let stale = ChannelState::initial(handle.proposal());
    ledgers
        .eth
        .dispute(handle.id(), &stale)
        .await
        .expect("registering v0 on empty ledger");

    assert_eq!(wait_phase(&handle, ChannelPhase::Disputed).await, ChannelPhase::Disputed);
    assert_eq!(wait_phase(&accepted, ChannelPhase::Disputed).await, ChannelPhase::Disputed);
    settle().await;

    assert_eq!(alice.recovery.calls(), vec![asset_a()]);
    assert_eq!(bob.recovery.calls(), vec![asset_a()]);
    assert_eq!(ledgers.eth.registered_version(&handle.id()), Some(1));
    // Nothing happened on the other ledger.
    assert_eq!(ledgers.sol.registered_version(&handle.id()), None);
}

#[tokio::test]
async fn test_stale_registration_right_after_open_is_disputed() {
    let ledgers = Ledgers::new();
    let bus = Arc::new(LocalBus::new());
    let alice = spawn_party("alice", &bus, ledgers.backends()).expect("alice");
    let _bob = spawn_party("bob", &bus, ledgers.backends()).expect("bob");
    let handle = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect("open should succeed");

    // No pause: the watcher is subscribed by the time the channel is open.
    advance(&handle);
    ledgers
        .eth
        .dispute(handle.id(), &ChannelState::initial(handle.proposal()))
        .await
        .expect("register stale state");

    assert_eq!(wait_phase(&handle, ChannelPhase::Disputed).await, ChannelPhase::Disputed);
    settle().await;
    assert_eq!(alice.recovery.calls(), vec![asset_a()]);
    assert_eq!(ledgers.eth.registered_version(&handle.id()), Some(1));
}

#[tokio::test]
async fn test_agreed_registration_keeps_channel_open() {
    let ledgers = Ledgers::new();
    let (alice, _bob, handle, _accepted) = open(&ledgers).await;

    ledgers
        .sol
        .dispute(handle.id(), &handle.state())
        .await
        .expect("register agreed state");
    settle().await;

    assert_eq!(handle.phase(), ChannelPhase::Open);
    assert!(alice.recovery.calls().is_empty());
}

// =========================================================================
// Conclusion
// =========================================================================

#[tokio::test]
async fn test_conclude_on_every_ledger_closes_channel() {
    let ledgers = Ledgers::new();
    let (alice, bob, handle, accepted) = open(&ledgers).await;
    let state = handle.state();

    ledgers.eth.dispute(handle.id(), &state).await.expect("eth dispute");
    ledgers.eth.conclude(handle.id()).await.expect("eth conclude");
    settle().await;
    // One ledger concluded is not enough.
    assert_eq!(handle.phase(), ChannelPhase::Open);

    ledgers.sol.dispute(handle.id(), &state).await.expect("sol dispute");
    ledgers.sol.conclude(handle.id()).await.expect("sol conclude");

    assert_eq!(wait_phase(&handle, ChannelPhase::Closed).await, ChannelPhase::Closed);
    assert_eq!(wait_phase(&accepted, ChannelPhase::Closed).await, ChannelPhase::Closed);
    settle().await;
    assert!(!alice.coordinator.is_watching(&handle.id()));
    assert!(!bob.coordinator.is_watching(&accepted.id()));
}

// =========================================================================
// Watcher restarts
// =========================================================================

#[tokio::test]
async fn test_restart_watching_after_stream_ends() {
    let ledgers = Ledgers::new();
    let bus = Arc::new(LocalBus::new());
    let alice = spawn_party(
        "alice",
        &bus,
        vec![
            Backend::new(
                asset_a(),
                ledgers.eth.clone(),
                FlakyAdjudicator::new(ledgers.eth.clone(), 1),
            ),
            Backend::new(
                asset_b(),
                ledgers.sol.clone(),
                FlakyAdjudicator::new(ledgers.sol.clone(), 1),
            ),
        ],
    )
    .expect("alice");
    let _bob = spawn_party("bob", &bus, ledgers.backends()).expect("bob");

    let handle = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect("open should succeed");
    settle().await;

    // The first subscriptions ended; the channel stays open but unwatched.
    assert_eq!(handle.phase(), ChannelPhase::Open);
    assert!(!alice.coordinator.is_watching(&handle.id()));

    alice
        .coordinator
        .restart_watching(&handle.id())
        .await
        .expect("restart should succeed");
    assert!(alice.coordinator.is_watching(&handle.id()));
    assert!(matches!(
        alice.coordinator.restart_watching(&handle.id()).await,
        Err(ClientError::AlreadyWatching(_))
    ));
    settle().await;

    advance(&handle);
    ledgers
        .sol
        .dispute(handle.id(), &ChannelState::initial(handle.proposal()))
        .await
        .expect("register stale state");
    assert_eq!(wait_phase(&handle, ChannelPhase::Disputed).await, ChannelPhase::Disputed);
}

#[tokio::test]
async fn test_shutdown_keeps_watching_open_channels() {
    let ledgers = Ledgers::new();
    let (alice, bob, handle, _accepted) = open(&ledgers).await;

    alice.coordinator.shutdown();
    bob.coordinator.shutdown();
    assert!(matches!(
        bob.coordinator.accepted_channel().await,
        Err(ClientError::Shutdown)
    ));

    advance(&handle);
    ledgers
        .eth
        .dispute(handle.id(), &ChannelState::initial(handle.proposal()))
        .await
        .expect("register stale state");
    assert_eq!(wait_phase(&handle, ChannelPhase::Disputed).await, ChannelPhase::Disputed);
}

#[tokio::test]
async fn test_restart_after_partial_conclusion() {
    let ledgers = Ledgers::new();
    let bus = Arc::new(LocalBus::new());
    let alice = spawn_party(
        "alice",
        &bus,
        vec![
            Backend::new(
                asset_a(),
                ledgers.eth.clone(),
                FlakyAdjudicator::new(ledgers.eth.clone(), 1),
            ),
            Backend::new(
                asset_b(),
                ledgers.sol.clone(),
                FlakyAdjudicator::new(ledgers.sol.clone(), 1),
            ),
        ],
    )
    .expect("alice");
    let _bob = spawn_party("bob", &bus, ledgers.backends()).expect("bob");

    let handle = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect("open should succeed");
    settle().await;
    assert!(!alice.coordinator.is_watching(&handle.id()));

    // Asset A concludes while nobody is watching.
    let state = handle.state();
    ledgers.eth.dispute(handle.id(), &state).await.expect("eth dispute");
    ledgers.eth.conclude(handle.id()).await.expect("eth conclude");

    alice
        .coordinator
        .restart_watching(&handle.id())
        .await
        .expect("restart should succeed");
    settle().await;
    assert_eq!(handle.phase(), ChannelPhase::Open);

    ledgers.sol.dispute(handle.id(), &state).await.expect("sol dispute");
    ledgers.sol.conclude(handle.id()).await.expect("sol conclude");
    assert_eq!(wait_phase(&handle, ChannelPhase::Closed).await, ChannelPhase::Closed);
}
