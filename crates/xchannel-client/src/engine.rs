use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use xchannel_core::{AssetId, ChannelProposal, CoreError, PartIdx, ProposalId, WireAddress};
use xchannel_ledger::{FundingRequest, LedgerError, MultiFunder};

use crate::channel::ChannelHandle;
use crate::error::ClientError;
use crate::recovery::DisputeRecovery;
use crate::wire::{Envelope, MessageBus, WireMessage};

/// Receives inbound channel proposals. Each call runs in its own task.
#[async_trait]
pub trait ProposalHandler: Send + Sync {
    async fn handle_proposal(&self, from: WireAddress, proposal: ChannelProposal);
}

/// Peer's answer to one of our proposals.
#[derive(Debug)]
enum ProposalResponse {
    Accepted,
    Rejected(String),
}

/// Outbound proposals awaiting an answer, with the peer allowed to give it.
type PendingProposals = DashMap<ProposalId, (WireAddress, oneshot::Sender<ProposalResponse>)>;

/// Minimal two-party channel protocol over a `MessageBus`.
///
/// Sends and answers proposals, funds accepted channels through the
/// `MultiFunder`, and hands dispute recovery to a `DisputeRecovery`.
pub struct ChannelEngine {
    address: WireAddress,
    bus: Arc<dyn MessageBus>,
    funder: Arc<MultiFunder>,
    recovery: Arc<dyn DisputeRecovery>,
    pending: Arc<PendingProposals>,
    inbound: Mutex<Option<mpsc::Receiver<Envelope>>>,
    closed: watch::Sender<bool>,
}

impl ChannelEngine {
    /// Create an engine and claim `address` on the bus.
    pub fn new(
        address: WireAddress,
        bus: Arc<dyn MessageBus>,
        funder: Arc<MultiFunder>,
        recovery: Arc<dyn DisputeRecovery>,
    ) -> Result<Self, ClientError> {
        let inbound = bus.subscribe(&address)?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            address,
            bus,
            funder,
            recovery,
            pending: Arc::new(DashMap::new()),
            inbound: Mutex::new(Some(inbound)),
            closed,
        })
    }

    pub fn address(&self) -> &WireAddress {
        &self.address
    }

    pub fn recovery(&self) -> Arc<dyn DisputeRecovery> {
        self.recovery.clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`; an error cannot happen while we borrow it.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Spawn the inbound loop, dispatching proposals to `handler`.
    ///
    /// Responses to our own proposals are only processed while the loop runs.
    pub fn start(&self, handler: Arc<dyn ProposalHandler>) -> Result<(), ClientError> {
        let mut inbound = self
            .inbound
            .lock()
            .map_err(|_| ClientError::Internal("engine inbound lock poisoned".into()))?
            .take()
            .ok_or_else(|| ClientError::Internal("engine already started".into()))?;
        let pending = self.pending.clone();
        let mut closed = self.closed.subscribe();
        let address = self.address.clone();

        tokio::spawn(async move {
            tracing::info!(address = %address, "channel engine started");
            loop {
                tokio::select! {
                    _ = closed.wait_for(|c| *c) => break,
                    envelope = inbound.recv() => match envelope {
                        Some(envelope) => dispatch(envelope, &pending, &handler),
                        None => break,
                    },
                }
            }
            // Fail every outstanding proposal.
            pending.clear();
            tracing::info!(address = %address, "channel engine stopped");
        });
        Ok(())
    }

    /// Send `proposal` to its other participant and wait for the answer.
    ///
    /// Every error names the proposed channel.
    pub async fn propose(
        &self,
        proposal: &ChannelProposal,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let channel = proposal.channel_id();
        self.send_proposal(proposal, timeout)
            .await
            .map_err(|e| match e.channel() {
                Some(_) => e,
                None => ClientError::ProposalFailed {
                    channel,
                    source: Box::new(e),
                },
            })
    }

    async fn send_proposal(
        &self,
        proposal: &ChannelProposal,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        let channel = proposal.channel_id();
        let peer = proposal
            .participants
            .iter()
            .map(|p| &p.wire)
            .find(|wire| **wire != self.address)
            .cloned()
            .ok_or_else(|| CoreError::InvalidProposal("no peer participant".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(proposal.id, (peer.clone(), tx));
        let envelope = Envelope {
            from: self.address.clone(),
            to: peer.clone(),
            message: WireMessage::Proposal(proposal.clone()),
        };
        if let Err(e) = self.bus.send(envelope).await {
            self.pending.remove(&proposal.id);
            return Err(e);
        }
        tracing::info!(channel = %channel, peer = %peer, "proposal sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ProposalResponse::Accepted)) => {
                tracing::info!(channel = %channel, "proposal accepted");
                Ok(())
            }
            Ok(Ok(ProposalResponse::Rejected(reason))) => {
                tracing::warn!(channel = %channel, reason = %reason, "proposal rejected");
                Err(ClientError::ProposalRejected { channel, reason })
            }
            Ok(Err(_)) => Err(ClientError::Shutdown),
            Err(_) => {
                self.pending.remove(&proposal.id);
                tracing::warn!(channel = %channel, "proposal timed out");
                Err(ClientError::ProposalTimeout { channel })
            }
        }
    }

    /// Accept an inbound proposal.
    pub async fn accept(&self, proposal: &ChannelProposal) -> Result<(), ClientError> {
        self.answer(
            proposal,
            WireMessage::Accept {
                proposal_id: proposal.id,
            },
        )
        .await
    }

    /// Reject an inbound proposal with `reason`.
    pub async fn reject(
        &self,
        proposal: &ChannelProposal,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.answer(
            proposal,
            WireMessage::Reject {
                proposal_id: proposal.id,
                reason: reason.into(),
            },
        )
        .await
    }

    async fn answer(
        &self,
        proposal: &ChannelProposal,
        message: WireMessage,
    ) -> Result<(), ClientError> {
        let proposer = proposal
            .participants
            .first()
            .ok_or_else(|| CoreError::InvalidProposal("no participants".into()))?;
        self.bus
            .send(Envelope {
                from: self.address.clone(),
                to: proposer.wire.clone(),
                message,
            })
            .await
    }

    /// Fund `part_idx`'s share of every asset in the proposal's allocation.
    pub async fn fund(
        &self,
        proposal: &ChannelProposal,
        part_idx: PartIdx,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let request = FundingRequest::from_proposal(proposal, part_idx);
        let channel = request.channel;
        self.funder
            .fund(&request, timeout)
            .await
            .map_err(|source| ClientError::Funding { channel, source })
    }

    /// Run the dispute recovery procedure for `asset`.
    pub async fn recover(
        &self,
        channel: &ChannelHandle,
        asset: &AssetId,
    ) -> Result<(), LedgerError> {
        self.recovery.recover(channel, asset).await
    }

    /// Stop accepting messages and release the bus address. Idempotent.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.bus.unsubscribe(&self.address);
        self.pending.clear();
        tracing::info!(address = %self.address, "channel engine closed");
    }
}

fn dispatch(
    envelope: Envelope,
    pending: &PendingProposals,
    handler: &Arc<dyn ProposalHandler>,
) {
    let Envelope { from, message, .. } = envelope;
    match message {
        WireMessage::Proposal(proposal) => {
            tracing::debug!(from = %from, proposal = %proposal.id, "inbound proposal");
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle_proposal(from, proposal).await });
        }
        WireMessage::Accept { proposal_id } => {
            respond(pending, proposal_id, ProposalResponse::Accepted, &from);
        }
        WireMessage::Reject {
            proposal_id,
            reason,
        } => {
            respond(pending, proposal_id, ProposalResponse::Rejected(reason), &from);
        }
    }
}

/// Deliver an answer, but only from the peer the proposal was sent to.
fn respond(
    pending: &PendingProposals,
    proposal_id: ProposalId,
    response: ProposalResponse,
    from: &WireAddress,
) {
    match pending.remove_if(&proposal_id, |_, (peer, _)| peer == from) {
        Some((_, (_, tx))) => {
            // The proposer may have stopped waiting.
            let _ = tx.send(response);
        }
        None => {
            tracing::debug!(
                from = %from,
                proposal = %proposal_id,
                "answer for unknown proposal or from another party ignored"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::LocalBus;
    use xchannel_core::{Allocation, LedgerAddress, LedgerId, Participant};
    use xchannel_ledger::{AssetRegistry, MultiAdjudicator};

    use crate::recovery::AdjudicatorRecovery;

    /// Answers every proposal with a fixed decision.
    struct FixedHandler {
        engine: Arc<ChannelEngine>,
        accept: bool,
    }

    #[async_trait]
    impl ProposalHandler for FixedHandler {
        async fn handle_proposal(&self, _from: WireAddress, proposal: ChannelProposal) {
            let result = if self.accept {
                self.engine.accept(&proposal).await
            } else {
                self.engine.reject(&proposal, "not interested").await
            };
            result.unwrap();
        }
    }

    /// Never answers.
    struct SilentHandler;

    #[async_trait]
    impl ProposalHandler for SilentHandler {
        async fn handle_proposal(&self, _from: WireAddress, _proposal: ChannelProposal) {}
    }

    fn engine(bus: &Arc<LocalBus>, name: &str) -> Arc<ChannelEngine> {
        let registry = Arc::new(AssetRegistry::new());
        let funder = Arc::new(MultiFunder::new(registry.clone()));
        let recovery = Arc::new(AdjudicatorRecovery::new(
            Arc::new(MultiAdjudicator::new(registry)),
            0,
            Duration::ZERO,
        ));
        Arc::new(ChannelEngine::new(WireAddress::new(name), bus.clone(), funder, recovery).unwrap())
    }

    fn proposal() -> ChannelProposal {
        let asset = AssetId::new(LedgerId::new("eth:1337"), "0xholder");
        let party = |name: &str| {
            Participant::new(WireAddress::new(name))
                .with_address(asset.ledger().clone(), LedgerAddress::new(name))
        };
        let mut alloc = Allocation::new(2, vec![asset.clone()]);
        alloc.set_asset_balances(&asset, vec![1, 0]).unwrap();
        ChannelProposal::new(1000, vec![party("alice"), party("bob")], alloc).unwrap()
    }

    fn pair(accept: bool) -> (Arc<ChannelEngine>, Arc<ChannelEngine>) {
        let bus = Arc::new(LocalBus::new());
        let alice = engine(&bus, "alice");
        let bob = engine(&bus, "bob");
        alice.start(Arc::new(SilentHandler)).unwrap();
        bob.start(Arc::new(FixedHandler {
            engine: bob.clone(),
            accept,
        }))
        .unwrap();
        (alice, bob)
    }

    #[tokio::test]
    async fn test_propose_accepted() {
        let (alice, _bob) = pair(true);
        alice
            .propose(&proposal(), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_propose_rejected_names_channel() {
        let (alice, _bob) = pair(false);
        let p = proposal();
        let err = alice.propose(&p, Duration::from_secs(1)).await.unwrap_err();
        match err {
            ClientError::ProposalRejected { channel, reason } => {
                assert_eq!(channel, p.channel_id());
                assert_eq!(reason, "not interested");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_propose_timeout() {
        let bus = Arc::new(LocalBus::new());
        let alice = engine(&bus, "alice");
        let bob = engine(&bus, "bob");
        alice.start(Arc::new(SilentHandler)).unwrap();
        bob.start(Arc::new(SilentHandler)).unwrap();

        let err = alice
            .propose(&proposal(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ProposalTimeout { .. }));
        assert!(alice.pending.is_empty());
    }

    #[tokio::test]
    async fn test_propose_to_absent_peer_names_channel() {
        let bus = Arc::new(LocalBus::new());
        let alice = engine(&bus, "alice");
        let p = proposal();
        let err = alice.propose(&p, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.channel(), Some(p.channel_id()));
        match err {
            ClientError::ProposalFailed { source, .. } => {
                assert!(matches!(*source, ClientError::PeerUnreachable(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(alice.pending.is_empty());
    }

    #[tokio::test]
    async fn test_answer_from_other_party_ignored() {
        let bus = Arc::new(LocalBus::new());
        let alice = engine(&bus, "alice");
        let bob = engine(&bus, "bob");
        alice.start(Arc::new(SilentHandler)).unwrap();
        bob.start(Arc::new(SilentHandler)).unwrap();

        let p = proposal();
        let forged = Envelope {
            from: WireAddress::new("mallory"),
            to: WireAddress::new("alice"),
            message: WireMessage::Accept { proposal_id: p.id },
        };
        let (result, _) = tokio::join!(alice.propose(&p, Duration::from_millis(100)), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bus.send(forged).await.unwrap();
        });
        assert!(matches!(result, Err(ClientError::ProposalTimeout { .. })));
    }

    #[tokio::test]
    async fn test_close_releases_address() {
        let bus = Arc::new(LocalBus::new());
        let alice = engine(&bus, "alice");
        alice.start(Arc::new(SilentHandler)).unwrap();
        alice.close();
        alice.close();
        assert!(alice.is_closed());
        assert!(!bus.is_registered(&WireAddress::new("alice")));
        alice.closed().await;

        let err = alice
            .propose(&proposal(), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ClientError::ProposalFailed { source, .. } => {
                assert!(matches!(*source, ClientError::Shutdown));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let bus = Arc::new(LocalBus::new());
        let alice = engine(&bus, "alice");
        alice.start(Arc::new(SilentHandler)).unwrap();
        assert!(alice.start(Arc::new(SilentHandler)).is_err());
    }

    #[tokio::test]
    async fn test_fund_error_names_channel() {
        let bus = Arc::new(LocalBus::new());
        let alice = engine(&bus, "alice");
        let p = proposal();
        let err = alice.fund(&p, 0, Duration::from_secs(1)).await.unwrap_err();
        match err {
            ClientError::Funding { channel, source } => {
                assert_eq!(channel, p.channel_id());
                assert!(matches!(source, LedgerError::UnknownAsset(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
