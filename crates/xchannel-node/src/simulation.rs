//! Local two-party, multi-ledger channel run.
//!
//! Every configured ledger is backed by an in-memory `LocalLedger`. The
//! proposer funds the assets of the first (and every other even-indexed)
//! ledger, the peer those of the remaining ledgers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use xchannel_client::{ChannelCoordinator, LocalBus, MessageBus};
use xchannel_core::{
    Allocation, AssetId, ChannelId, ChannelPhase, LedgerAddress, Participant, SetupConfig,
    WireAddress,
};
use xchannel_ledger::{AssetRegistry, LocalLedger, MultiAdjudicator, MultiFunder};

const PROPOSER: &str = "alice";
const PEER: &str = "bob";

/// Outcome of a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub channel: ChannelId,
    pub proposer_phase: ChannelPhase,
    pub peer_phase: ChannelPhase,
    pub assets: Vec<AssetId>,
}

/// Open one channel between two local coordinators and shut both down.
pub async fn run(config: &SetupConfig) -> anyhow::Result<SimulationReport> {
    config.validate()?;
    let challenge = config.channel.challenge_duration_secs;

    let ledgers: Vec<Arc<LocalLedger>> = config
        .ledgers
        .iter()
        .map(|l| Arc::new(LocalLedger::new(l.ledger_id()).with_challenge_duration(challenge)))
        .collect();

    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
    let proposer = coordinator(config, &ledgers, &bus, PROPOSER, 0)?;
    let peer = coordinator(config, &ledgers, &bus, PEER, 1)?;

    let assets = config.asset_ids();
    let mut allocation = Allocation::new(2, assets.clone());
    for (idx, ledger) in config.ledgers.iter().enumerate() {
        for (asset, asset_cfg) in ledger.asset_ids().iter().zip(&ledger.assets) {
            let amount = u128::from(asset_cfg.funding_amount);
            let balances = if idx % 2 == 0 {
                vec![amount, 0]
            } else {
                vec![0, amount]
            };
            allocation.set_asset_balances(asset, balances)?;
        }
    }

    tracing::info!(
        ledgers = ledgers.len(),
        assets = assets.len(),
        "opening channel between {} and {}",
        PROPOSER,
        PEER
    );
    let handle = proposer
        .open_channel(peer.participant().clone(), allocation, challenge)
        .await
        .context("opening channel")?;

    let wait = config.channel.proposal_timeout() + config.channel.funding_timeout();
    let accepted = tokio::time::timeout(wait, peer.accepted_channel())
        .await
        .context("waiting for the peer to accept")??;
    tracing::info!(channel = %accepted.id(), phase = %accepted.phase(), "peer has channel");

    let report = SimulationReport {
        channel: handle.id(),
        proposer_phase: handle.phase(),
        peer_phase: accepted.phase(),
        assets,
    };

    proposer.shutdown();
    peer.shutdown();
    // Let the engines drain before the runtime goes away.
    tokio::time::sleep(Duration::from_millis(10)).await;
    Ok(report)
}

fn coordinator(
    config: &SetupConfig,
    ledgers: &[Arc<LocalLedger>],
    bus: &Arc<dyn MessageBus>,
    name: &str,
    part_idx: usize,
) -> anyhow::Result<ChannelCoordinator> {
    let mut registry = AssetRegistry::new();
    let mut participant = Participant::new(WireAddress::new(name));
    for (ledger_cfg, ledger) in config.ledgers.iter().zip(ledgers) {
        for asset in ledger_cfg.asset_ids() {
            registry.register(asset, ledger.clone(), ledger.clone())?;
        }
        let address = if part_idx == 0 {
            ledger_cfg.account.clone()
        } else {
            format!("{}#{}", ledger_cfg.account, part_idx)
        };
        participant = participant.with_address(ledger_cfg.ledger_id(), LedgerAddress::new(address));
    }

    let registry = Arc::new(registry);
    let coordinator = ChannelCoordinator::new(
        participant,
        config.channel.clone(),
        bus.clone(),
        Arc::new(MultiFunder::new(registry.clone())),
        Arc::new(MultiAdjudicator::new(registry)),
    )?;
    Ok(coordinator)
}
