//! Shared fixtures for the cross-crate scenario tests.
//!
//! Two in-memory ledgers, instrumented funder/adjudicator wrappers, and a
//! helper that wires a `ChannelCoordinator` for one party.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use xchannel_client::{
    AdjudicatorRecovery, ChannelCoordinator, ChannelHandle, ClientError, DisputeRecovery, LocalBus,
};
use xchannel_core::{
    Allocation, AssetId, ChannelConfig, ChannelId, ChannelState, LedgerAddress, LedgerId,
    Participant, WireAddress,
};
use xchannel_ledger::{
    Adjudicator, AdjudicatorEvent, AssetFundingRequest, AssetRegistry, EventStream, Funder,
    LedgerError, LocalLedger, MultiAdjudicator, MultiFunder,
};

pub const ETH: &str = "eth:1337";
pub const SOL: &str = "sol:localnet";

/// Asset A: the ETH asset holder.
pub fn asset_a() -> AssetId {
    AssetId::new(LedgerId::new(ETH), "0xasset-holder")
}

/// Asset B: native SOL.
pub fn asset_b() -> AssetId {
    AssetId::new(LedgerId::new(SOL), "11111111111111111111111111111111")
}

pub fn party(name: &str) -> Participant {
    Participant::new(WireAddress::new(name))
        .with_address(LedgerId::new(ETH), LedgerAddress::new(format!("0x{}", name)))
        .with_address(LedgerId::new(SOL), LedgerAddress::new(format!("{}.sol", name)))
}

/// Proposer funds 1 of asset A, the peer 50 of asset B.
pub fn allocation() -> Allocation {
    let mut alloc = Allocation::new(2, vec![asset_a(), asset_b()]);
    alloc
        .set_asset_balances(&asset_a(), vec![1, 0])
        .expect("asset A is part of the allocation");
    alloc
        .set_asset_balances(&asset_b(), vec![0, 50])
        .expect("asset B is part of the allocation");
    alloc
}

pub fn channel_config() -> ChannelConfig {
    ChannelConfig {
        proposal_timeout_secs: 2,
        funding_timeout_secs: 2,
        dispute_retries: 2,
        dispute_backoff_ms: 1,
        ..ChannelConfig::default()
    }
}

/// The two shared ledgers both parties fund on.
pub struct Ledgers {
    pub eth: Arc<LocalLedger>,
    pub sol: Arc<LocalLedger>,
}

impl Ledgers {
    pub fn new() -> Self {
        Self {
            eth: Arc::new(LocalLedger::new(LedgerId::new(ETH))),
            sol: Arc::new(LocalLedger::new(LedgerId::new(SOL))),
        }
    }

    /// Plain backends for both assets.
    pub fn backends(&self) -> Vec<Backend> {
        vec![
            Backend::new(asset_a(), self.eth.clone(), self.eth.clone()),
            Backend::new(asset_b(), self.sol.clone(), self.sol.clone()),
        ]
    }
}

impl Default for Ledgers {
    fn default() -> Self {
        Self::new()
    }
}

/// Funder and adjudicator registered for one asset.
pub struct Backend {
    pub asset: AssetId,
    pub funder: Arc<dyn Funder>,
    pub adjudicator: Arc<dyn Adjudicator>,
}

impl Backend {
    pub fn new(asset: AssetId, funder: Arc<dyn Funder>, adjudicator: Arc<dyn Adjudicator>) -> Self {
        Self {
            asset,
            funder,
            adjudicator,
        }
    }
}

/// Funder wrapper that counts calls and can be told to fail.
pub struct CountingFunder {
    inner: Arc<dyn Funder>,
    calls: AtomicUsize,
    failure: Option<String>,
}

impl CountingFunder {
    pub fn new(inner: Arc<dyn Funder>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
            failure: None,
        })
    }

    pub fn failing(inner: Arc<dyn Funder>, reason: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
            failure: Some(reason.to_string()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Funder for CountingFunder {
    async fn fund(&self, request: AssetFundingRequest) -> Result<(), LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.failure {
            return Err(LedgerError::Rejected {
                ledger: request.asset().ledger().clone(),
                reason: reason.clone(),
            });
        }
        self.inner.fund(request).await
    }
}

/// Adjudicator wrapper whose first `broken` subscriptions end immediately.
pub struct FlakyAdjudicator {
    inner: Arc<dyn Adjudicator>,
    broken: AtomicUsize,
}

impl FlakyAdjudicator {
    pub fn new(inner: Arc<dyn Adjudicator>, broken: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            broken: AtomicUsize::new(broken),
        })
    }
}

#[async_trait]
impl Adjudicator for FlakyAdjudicator {
    async fn subscribe(&self, channel: ChannelId) -> Result<EventStream, LedgerError> {
        let broken = self
            .broken
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if broken {
            tracing::debug!(channel = %channel, "handing out an ended subscription");
            return Ok(stream::empty::<Result<AdjudicatorEvent, LedgerError>>().boxed());
        }
        self.inner.subscribe(channel).await
    }

    async fn dispute(&self, channel: ChannelId, state: &ChannelState) -> Result<(), LedgerError> {
        self.inner.dispute(channel, state).await
    }

    async fn conclude(&self, channel: ChannelId) -> Result<(), LedgerError> {
        self.inner.conclude(channel).await
    }
}

/// Recovery wrapper recording every asset it was invoked for.
pub struct CountingRecovery {
    inner: Arc<dyn DisputeRecovery>,
    calls: Mutex<Vec<AssetId>>,
}

impl CountingRecovery {
    pub fn new(inner: Arc<dyn DisputeRecovery>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<AssetId> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DisputeRecovery for CountingRecovery {
    async fn recover(&self, channel: &ChannelHandle, asset: &AssetId) -> Result<(), LedgerError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(asset.clone());
        }
        self.inner.recover(channel, asset).await
    }
}

/// One party's coordinator plus the recovery it was wired with.
pub struct TestParty {
    pub coordinator: ChannelCoordinator,
    pub recovery: Arc<CountingRecovery>,
}

/// Wire a coordinator for `name` on `bus` with the given backends.
pub fn spawn_party(
    name: &str,
    bus: &Arc<LocalBus>,
    backends: Vec<Backend>,
) -> Result<TestParty, ClientError> {
    let mut registry = AssetRegistry::new();
    for backend in backends {
        registry.register(backend.asset, backend.funder, backend.adjudicator)?;
    }
    let registry = Arc::new(registry);
    let config = channel_config();
    let adjudicator = Arc::new(MultiAdjudicator::new(registry.clone()));
    let recovery = CountingRecovery::new(Arc::new(AdjudicatorRecovery::from_config(
        adjudicator.clone(),
        &config,
    )));
    let coordinator = ChannelCoordinator::with_recovery(
        party(name),
        config,
        bus.clone(),
        Arc::new(MultiFunder::new(registry)),
        adjudicator,
        recovery.clone(),
    )?;
    Ok(TestParty {
        coordinator,
        recovery,
    })
}

/// Let spawned tasks make progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
