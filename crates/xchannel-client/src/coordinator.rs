use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use xchannel_core::{
    Allocation, ChannelConfig, ChannelEvent, ChannelId, ChannelProposal, CoreError,
    LedgerAddress, LedgerId, Participant, WireAddress,
};
use xchannel_ledger::{LedgerError, MultiAdjudicator, MultiFunder};

use crate::channel::ChannelHandle;
use crate::engine::{ChannelEngine, ProposalHandler};
use crate::error::{ClientError, WatcherError};
use crate::recovery::{AdjudicatorRecovery, DisputeRecovery};
use crate::watcher::{DisputeWatcher, LifecycleUpdate};
use crate::wire::MessageBus;

const UPDATE_CAPACITY: usize = 256;

type ChannelTable = Arc<DashMap<ChannelId, Arc<ChannelHandle>>>;

/// Application entry point for cross-ledger channels.
///
/// Owns the participant identity, every channel handle it created or
/// accepted, and one dispute watcher per open channel.
pub struct ChannelCoordinator {
    inner: Arc<CoordinatorInner>,
    accepted: Mutex<mpsc::Receiver<Arc<ChannelHandle>>>,
}

struct CoordinatorInner {
    participant: Participant,
    config: ChannelConfig,
    engine: Arc<ChannelEngine>,
    funder: Arc<MultiFunder>,
    adjudicator: Arc<MultiAdjudicator>,
    channels: ChannelTable,
    watchers: DashMap<ChannelId, JoinHandle<()>>,
    updates: mpsc::Sender<LifecycleUpdate>,
    accepted: mpsc::Sender<Arc<ChannelHandle>>,
}

impl ChannelCoordinator {
    /// Create a coordinator using `AdjudicatorRecovery` for disputes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        participant: Participant,
        config: ChannelConfig,
        bus: Arc<dyn MessageBus>,
        funder: Arc<MultiFunder>,
        adjudicator: Arc<MultiAdjudicator>,
    ) -> Result<Self, ClientError> {
        let recovery = Arc::new(AdjudicatorRecovery::from_config(adjudicator.clone(), &config));
        Self::with_recovery(participant, config, bus, funder, adjudicator, recovery)
    }

    /// Create a coordinator with a custom dispute recovery procedure.
    pub fn with_recovery(
        participant: Participant,
        config: ChannelConfig,
        bus: Arc<dyn MessageBus>,
        funder: Arc<MultiFunder>,
        adjudicator: Arc<MultiAdjudicator>,
        recovery: Arc<dyn DisputeRecovery>,
    ) -> Result<Self, ClientError> {
        let engine = Arc::new(ChannelEngine::new(
            participant.wire.clone(),
            bus,
            funder.clone(),
            recovery,
        )?);
        let (updates, updates_rx) = mpsc::channel(UPDATE_CAPACITY);
        let (accepted, accepted_rx) = mpsc::channel(config.accepted_queue_capacity.max(1));
        let channels: ChannelTable = Arc::new(DashMap::new());

        tokio::spawn(run_lifecycle(channels.clone(), updates_rx));

        let inner = Arc::new(CoordinatorInner {
            participant,
            config,
            engine: engine.clone(),
            funder,
            adjudicator,
            channels,
            watchers: DashMap::new(),
            updates,
            accepted,
        });
        engine.start(inner.clone())?;
        tracing::info!(address = %inner.participant.wire, "channel coordinator ready");

        Ok(Self {
            inner,
            accepted: Mutex::new(accepted_rx),
        })
    }

    pub fn participant(&self) -> &Participant {
        &self.inner.participant
    }

    /// Our account address on `ledger`.
    pub fn address(&self, ledger: &LedgerId) -> Option<&LedgerAddress> {
        self.inner.participant.address(ledger)
    }

    pub fn wire_address(&self) -> &WireAddress {
        &self.inner.participant.wire
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Propose a two-party channel to `peer`, fund it, and start watching it.
    ///
    /// Blocks until the channel is open or the attempt has failed. On
    /// failure the channel is left `Aborted`.
    pub async fn open_channel(
        &self,
        peer: Participant,
        allocation: Allocation,
        challenge_duration: u64,
    ) -> Result<Arc<ChannelHandle>, ClientError> {
        let inner = &self.inner;
        if inner.engine.is_closed() {
            return Err(ClientError::Shutdown);
        }
        if allocation.participants() != 2 {
            return Err(CoreError::InvalidAllocation(format!(
                "two-party channel needs 2 participants, got {}",
                allocation.participants()
            ))
            .into());
        }
        let participants = vec![inner.participant.clone(), peer];
        let proposal = ChannelProposal::new(challenge_duration, participants, allocation)?;
        inner.check_assets(&proposal)?;

        let handle = Arc::new(ChannelHandle::new(proposal, 0));
        let channel = handle.id();
        inner.channels.insert(channel, handle.clone());
        tracing::info!(
            channel = %channel,
            assets = handle.allocation().assets().len(),
            ledgers = handle.allocation().ledgers().len(),
            "opening channel"
        );

        if let Err(e) = inner
            .engine
            .propose(handle.proposal(), inner.config.proposal_timeout())
            .await
        {
            inner.abort(&handle, ChannelEvent::ProposalRejected, &e);
            return Err(e);
        }
        handle.transition(ChannelEvent::ProposalAccepted)?;

        if let Err(e) = inner
            .engine
            .fund(handle.proposal(), handle.part_idx(), inner.config.funding_timeout())
            .await
        {
            inner.abort(&handle, ChannelEvent::FundingFailed, &e);
            return Err(e);
        }
        handle.transition(ChannelEvent::FundingCompleted)?;
        inner.watch_opened(&handle).await;

        tracing::info!(channel = %channel, "channel open");
        Ok(handle)
    }

    /// Next channel opened on a peer's proposal.
    ///
    /// Returns `ClientError::Shutdown` once the coordinator is shut down.
    pub async fn accepted_channel(&self) -> Result<Arc<ChannelHandle>, ClientError> {
        let mut queue = self.accepted.lock().await;
        tokio::select! {
            biased;
            handle = queue.recv() => handle.ok_or(ClientError::Shutdown),
            _ = self.inner.engine.closed() => Err(ClientError::Shutdown),
        }
    }

    pub fn channel(&self, id: &ChannelId) -> Option<Arc<ChannelHandle>> {
        self.inner.channels.get(id).map(|h| h.value().clone())
    }

    pub fn channels(&self) -> Vec<Arc<ChannelHandle>> {
        self.inner
            .channels
            .iter()
            .map(|h| h.value().clone())
            .collect()
    }

    /// Whether a watcher task is currently running for `id`.
    pub fn is_watching(&self, id: &ChannelId) -> bool {
        self.inner
            .watchers
            .get(id)
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Start a new watcher for an open or disputed channel whose previous
    /// watcher has ended.
    ///
    /// Returns once the watcher is subscribed. Registrations made while the
    /// channel was unwatched are replayed to it.
    pub async fn restart_watching(&self, id: &ChannelId) -> Result<(), ClientError> {
        let handle = self.channel(id).ok_or(ClientError::UnknownChannel(*id))?;
        let phase = handle.phase();
        if !phase.is_watchable() {
            return Err(ClientError::NotWatchable {
                channel: *id,
                phase,
            });
        }
        if self.is_watching(id) {
            return Err(ClientError::AlreadyWatching(*id));
        }
        tracing::info!(channel = %id, "restarting dispute watcher");
        self.inner.start_watcher(&handle).await?;
        Ok(())
    }

    /// Drop a closed or aborted channel and everything tracked for it.
    pub fn forget_channel(&self, id: &ChannelId) -> Result<Arc<ChannelHandle>, ClientError> {
        let handle = self.channel(id).ok_or(ClientError::UnknownChannel(*id))?;
        let phase = handle.phase();
        if !phase.is_final() {
            return Err(ClientError::ChannelActive {
                channel: *id,
                phase,
            });
        }
        self.inner.channels.remove(id);
        self.inner.watchers.remove(id);
        self.inner.funder.forget(id);
        tracing::debug!(channel = %id, phase = %phase, "channel forgotten");
        Ok(handle)
    }

    /// Stop accepting proposals and release the wire address.
    ///
    /// Open channels keep being watched.
    pub fn shutdown(&self) {
        tracing::info!(address = %self.inner.participant.wire, "shutting down channel coordinator");
        self.inner.engine.close();
    }
}

impl Drop for ChannelCoordinator {
    fn drop(&mut self) {
        self.inner.engine.close();
    }
}

impl CoordinatorInner {
    /// Every asset of the proposal must be fundable and disputable here.
    fn check_assets(&self, proposal: &ChannelProposal) -> Result<(), LedgerError> {
        for asset in proposal.allocation.assets() {
            self.funder.registry().funder(asset)?;
            self.adjudicator.registry().adjudicator(asset)?;
        }
        Ok(())
    }

    /// Why an inbound proposal cannot be accepted, if it cannot.
    fn check_inbound(&self, from: &WireAddress, proposal: &ChannelProposal) -> Result<(), String> {
        proposal.validate().map_err(|e| e.to_string())?;
        if proposal.participants.len() != 2 {
            return Err(format!(
                "expected 2 participants, got {}",
                proposal.participants.len()
            ));
        }
        let (proposer, us) = (&proposal.participants[0], &proposal.participants[1]);
        if &proposer.wire != from {
            return Err(format!("proposal sent by {} on behalf of {}", from, proposer.wire));
        }
        if us.wire != self.participant.wire {
            return Err(format!("participant 1 is {}, not {}", us.wire, self.participant.wire));
        }
        for ledger in proposal.allocation.ledgers() {
            if us.address(&ledger) != self.participant.address(&ledger) {
                return Err(format!("unexpected own address on ledger {}", ledger));
            }
        }
        self.check_assets(proposal).map_err(|e| e.to_string())
    }

    fn abort(&self, handle: &ChannelHandle, event: ChannelEvent, cause: &ClientError) {
        match handle.transition(event) {
            Ok(phase) => {
                tracing::warn!(
                    channel = %handle.id(),
                    phase = %phase,
                    error = %cause,
                    "channel aborted"
                );
            }
            Err(e) => {
                tracing::error!(channel = %handle.id(), error = %e, "abort transition failed");
            }
        }
    }

    /// Subscribe a watcher for `handle` and spawn its event loop.
    async fn start_watcher(&self, handle: &Arc<ChannelHandle>) -> Result<(), WatcherError> {
        let channel = handle.id();
        let watcher = DisputeWatcher::new(
            handle,
            self.adjudicator.clone(),
            self.engine.recovery(),
            self.updates.clone(),
        )
        .subscribe()
        .await?;
        let updates = self.updates.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = watcher.run().await {
                tracing::warn!(channel = %channel, error = %e, "dispute watcher stopped");
                let _ = updates.send(LifecycleUpdate::WatcherFailed(e)).await;
            }
        });
        self.watchers.insert(channel, task);
        Ok(())
    }

    /// Start watching a freshly opened channel. The channel stays open if
    /// the watcher cannot subscribe.
    async fn watch_opened(&self, handle: &Arc<ChannelHandle>) {
        if let Err(e) = self.start_watcher(handle).await {
            tracing::warn!(channel = %handle.id(), error = %e, "dispute watcher not started");
            let _ = self.updates.send(LifecycleUpdate::WatcherFailed(e)).await;
        }
    }

    async fn accept_inbound(
        &self,
        handle: Arc<ChannelHandle>,
    ) -> Result<Arc<ChannelHandle>, ClientError> {
        let channel = handle.id();
        handle.transition(ChannelEvent::ProposalAccepted)?;

        if let Err(e) = self.engine.accept(handle.proposal()).await {
            self.abort(&handle, ChannelEvent::FundingFailed, &e);
            return Err(e);
        }
        tracing::info!(channel = %channel, "proposal accepted, funding");

        if let Err(e) = self
            .engine
            .fund(handle.proposal(), handle.part_idx(), self.config.funding_timeout())
            .await
        {
            self.abort(&handle, ChannelEvent::FundingFailed, &e);
            return Err(e);
        }
        handle.transition(ChannelEvent::FundingCompleted)?;
        self.watch_opened(&handle).await;
        tracing::info!(channel = %channel, "accepted channel open");
        Ok(handle)
    }
}

#[async_trait]
impl ProposalHandler for CoordinatorInner {
    async fn handle_proposal(&self, from: WireAddress, proposal: ChannelProposal) {
        let channel = proposal.channel_id();
        if let Err(reason) = self.check_inbound(&from, &proposal) {
            tracing::warn!(
                channel = %channel,
                from = %from,
                reason = %reason,
                "rejecting proposal"
            );
            if let Err(e) = self.engine.reject(&proposal, reason).await {
                tracing::warn!(channel = %channel, error = %e, "failed to send rejection");
            }
            return;
        }

        let handle = Arc::new(ChannelHandle::new(proposal, 1));
        let claimed = match self.channels.entry(channel) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                true
            }
        };
        if !claimed {
            tracing::warn!(
                channel = %channel,
                from = %from,
                "rejecting proposal for known channel"
            );
            if let Err(e) = self.engine.reject(handle.proposal(), "channel already known").await {
                tracing::warn!(channel = %channel, error = %e, "failed to send rejection");
            }
            return;
        }

        let handle = match self.accept_inbound(handle).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "inbound channel failed");
                return;
            }
        };

        tokio::select! {
            sent = self.accepted.send(handle) => {
                if sent.is_err() {
                    tracing::debug!(channel = %channel, "accepted queue closed");
                }
            }
            _ = self.engine.closed() => {
                tracing::debug!(channel = %channel, "shut down before accepted channel was taken");
            }
        }
    }
}

/// Apply watcher updates to the channel table until every sender is gone.
async fn run_lifecycle(channels: ChannelTable, mut updates: mpsc::Receiver<LifecycleUpdate>) {
    while let Some(update) = updates.recv().await {
        match update {
            LifecycleUpdate::Event {
                channel,
                asset,
                event,
            } => {
                let Some(handle) = channels.get(&channel).map(|h| h.value().clone()) else {
                    tracing::warn!(channel = %channel, "update for unknown channel");
                    continue;
                };
                match handle.transition(event) {
                    Ok(phase) => match asset {
                        Some(asset) => tracing::info!(
                            channel = %channel,
                            asset = %asset,
                            phase = %phase,
                            "channel phase changed"
                        ),
                        None => tracing::info!(
                            channel = %channel,
                            phase = %phase,
                            "channel phase changed"
                        ),
                    },
                    Err(e) => tracing::warn!(
                        channel = %channel,
                        error = %e,
                        "lifecycle update rejected"
                    ),
                }
            }
            LifecycleUpdate::WatcherFailed(err) => {
                tracing::warn!(channel = %err.channel, error = %err, "watcher error");
            }
        }
    }
    tracing::debug!("lifecycle task exited");
}
