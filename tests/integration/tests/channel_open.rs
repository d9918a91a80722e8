//! Integration test: opening a channel across two ledgers.
//!
//! Two coordinators on one bus, funding asset A on the ETH ledger and asset
//! B on the SOL ledger through per-asset funders.

use std::sync::Arc;

use xchannel_client::{ClientError, LocalBus};
use xchannel_core::ChannelPhase;
use xchannel_integration_tests::{
    allocation, asset_a, asset_b, party, spawn_party, Backend, CountingFunder, Ledgers,
};
use xchannel_ledger::LedgerError;

// =========================================================================
// Happy path
// =========================================================================

#[tokio::test]
async fn test_open_succeeds_after_both_assets_fund() {
    let bus = Arc::new(LocalBus::new());
    let ledgers = Ledgers::new();
    let alice = spawn_party("alice", &bus, ledgers.backends()).expect("alice");
    let bob = spawn_party("bob", &bus, ledgers.backends()).expect("bob");

    let handle = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect("open should succeed");

    assert_eq!(handle.phase(), ChannelPhase::Open);
    assert_eq!(handle.allocation(), &allocation());
    assert_eq!(handle.state().allocation, allocation());
    assert_eq!(handle.version(), 0);

    // Both ledgers hold the full allocation.
    assert_eq!(
        ledgers.eth.deposits(&handle.id(), &asset_a()),
        Some(vec![1, 0])
    );
    assert_eq!(
        ledgers.sol.deposits(&handle.id(), &asset_b()),
        Some(vec![0, 50])
    );

    let accepted = bob
        .coordinator
        .accepted_channel()
        .await
        .expect("bob should receive the channel");
    assert_eq!(accepted.id(), handle.id());
    assert_eq!(accepted.phase(), ChannelPhase::Open);
    assert_eq!(accepted.allocation(), handle.allocation());
}

#[tokio::test]
async fn test_one_funding_call_per_asset_per_party() {
    let bus = Arc::new(LocalBus::new());
    let ledgers = Ledgers::new();

    let alice_eth = CountingFunder::new(ledgers.eth.clone());
    let alice_sol = CountingFunder::new(ledgers.sol.clone());
    let alice = spawn_party(
        "alice",
        &bus,
        vec![
            Backend::new(asset_a(), alice_eth.clone(), ledgers.eth.clone()),
            Backend::new(asset_b(), alice_sol.clone(), ledgers.sol.clone()),
        ],
    )
    .expect("alice");
    let _bob = spawn_party("bob", &bus, ledgers.backends()).expect("bob");

    let handle = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect("open should succeed");

    assert_eq!(alice_eth.calls(), 1);
    assert_eq!(alice_sol.calls(), 1);
    // Two parties, one submission each, per ledger.
    assert_eq!(ledgers.eth.submissions(&handle.id(), &asset_a()), 2);
    assert_eq!(ledgers.sol.submissions(&handle.id(), &asset_b()), 2);
}

#[tokio::test]
async fn test_peer_channels_are_listed() {
    let bus = Arc::new(LocalBus::new());
    let ledgers = Ledgers::new();
    let alice = spawn_party("alice", &bus, ledgers.backends()).expect("alice");
    let bob = spawn_party("bob", &bus, ledgers.backends()).expect("bob");

    let first = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect("first channel");
    bob.coordinator.accepted_channel().await.expect("first accepted");
    let second = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect("second channel");
    bob.coordinator.accepted_channel().await.expect("second accepted");

    assert_ne!(first.id(), second.id());
    assert_eq!(alice.coordinator.channels().len(), 2);
    assert_eq!(bob.coordinator.channels().len(), 2);
    assert!(bob.coordinator.channel(&first.id()).is_some());
}

// =========================================================================
// Failure paths
// =========================================================================

#[tokio::test]
async fn test_failed_asset_aborts_and_names_asset() {
    let bus = Arc::new(LocalBus::new());
    let ledgers = Ledgers::new();
    let failing_sol = CountingFunder::failing(ledgers.sol.clone(), "program error 0x1");
    let alice = spawn_party(
        "alice",
        &bus,
        vec![
            Backend::new(asset_a(), ledgers.eth.clone(), ledgers.eth.clone()),
            Backend::new(asset_b(), failing_sol.clone(), ledgers.sol.clone()),
        ],
    )
    .expect("alice");
    let _bob = spawn_party("bob", &bus, ledgers.backends()).expect("bob");

    let err = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect_err("funding B must fail");

    assert_eq!(err.failed_asset(), Some(&asset_b()));
    let channel = err.channel().expect("error names the channel");
    match err {
        ClientError::Funding {
            source: LedgerError::AssetFunding { asset, funded, .. },
            ..
        } => {
            assert_eq!(asset, asset_b());
            // A confirmed and is not unwound.
            assert_eq!(funded, vec![asset_a()]);
        }
        other => panic!("unexpected error: {other}"),
    }

    let handle = alice.coordinator.channel(&channel).expect("handle kept");
    assert_eq!(handle.phase(), ChannelPhase::Aborted);
    assert!(!alice.coordinator.is_watching(&channel));
    assert_eq!(failing_sol.calls(), 1);
}

#[tokio::test]
async fn test_peer_without_asset_rejects() {
    let bus = Arc::new(LocalBus::new());
    let ledgers = Ledgers::new();
    let alice = spawn_party("alice", &bus, ledgers.backends()).expect("alice");
    let _bob = spawn_party(
        "bob",
        &bus,
        vec![Backend::new(asset_a(), ledgers.eth.clone(), ledgers.eth.clone())],
    )
    .expect("bob");

    let err = alice
        .coordinator
        .open_channel(party("bob"), allocation(), 1000)
        .await
        .expect_err("bob cannot fund asset B");
    match &err {
        ClientError::ProposalRejected { reason, .. } => {
            assert!(reason.contains("unknown asset"), "reason: {reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    let channel = err.channel().expect("error names the channel");
    assert_eq!(
        alice.coordinator.channel(&channel).map(|h| h.phase()),
        Some(ChannelPhase::Aborted)
    );
    // Nothing was submitted on either ledger.
    assert_eq!(ledgers.eth.submissions(&channel, &asset_a()), 0);
}

#[tokio::test]
async fn test_duplicate_backend_registration_fails_setup() {
    let bus = Arc::new(LocalBus::new());
    let ledgers = Ledgers::new();
    let mut backends = ledgers.backends();
    backends.push(Backend::new(
        asset_a(),
        ledgers.eth.clone(),
        ledgers.eth.clone(),
    ));
    let result = spawn_party("alice", &bus, backends);
    assert!(matches!(
        result,
        Err(ClientError::Ledger(LedgerError::DuplicateAsset(a))) if a == asset_a()
    ));
}
