use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use xchannel_core::{ChannelProposal, ProposalId, WireAddress};

use crate::error::ClientError;

const INBOX_CAPACITY: usize = 64;

/// Off-chain messages of the two-party channel protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Proposal(ChannelProposal),
    Accept { proposal_id: ProposalId },
    Reject { proposal_id: ProposalId, reason: String },
}

/// A message addressed from one wire address to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: WireAddress,
    pub to: WireAddress,
    pub message: WireMessage,
}

/// Off-chain transport between channel participants.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver `envelope` to `envelope.to`.
    async fn send(&self, envelope: Envelope) -> Result<(), ClientError>;

    /// Register `address` and return its inbound message queue.
    fn subscribe(&self, address: &WireAddress) -> Result<mpsc::Receiver<Envelope>, ClientError>;

    /// Release `address`. Later sends to it fail with `PeerUnreachable`.
    fn unsubscribe(&self, address: &WireAddress);
}

/// In-process message bus: one bounded inbox per registered address.
#[derive(Default)]
pub struct LocalBus {
    inboxes: DashMap<WireAddress, mpsc::Sender<Envelope>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, address: &WireAddress) -> bool {
        self.inboxes.contains_key(address)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let inbox = self
            .inboxes
            .get(&envelope.to)
            .map(|tx| tx.value().clone())
            .ok_or_else(|| ClientError::PeerUnreachable(envelope.to.clone()))?;
        let to = envelope.to.clone();
        tracing::trace!(from = %envelope.from, to = %to, "bus send");
        inbox
            .send(envelope)
            .await
            .map_err(|_| ClientError::PeerUnreachable(to))
    }

    fn subscribe(&self, address: &WireAddress) -> Result<mpsc::Receiver<Envelope>, ClientError> {
        if self.inboxes.contains_key(address) {
            return Err(ClientError::AddressInUse(address.clone()));
        }
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.insert(address.clone(), tx);
        tracing::debug!(address = %address, "bus address registered");
        Ok(rx)
    }

    fn unsubscribe(&self, address: &WireAddress) {
        if self.inboxes.remove(address).is_some() {
            tracing::debug!(address = %address, "bus address released");
        }
    }
}
