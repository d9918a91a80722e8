use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use xchannel_core::{Allocation, AssetAllocation, AssetId, ChannelId, ChannelProposal, PartIdx};

use crate::error::LedgerError;

/// A whole-channel funding request handed to the `MultiFunder`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingRequest {
    pub channel: ChannelId,
    pub allocation: Allocation,
    /// Index of the participant on whose behalf funds are committed.
    pub part_idx: PartIdx,
}

impl FundingRequest {
    pub fn new(channel: ChannelId, allocation: Allocation, part_idx: PartIdx) -> Self {
        Self {
            channel,
            allocation,
            part_idx,
        }
    }

    pub fn from_proposal(proposal: &ChannelProposal, part_idx: PartIdx) -> Self {
        Self::new(proposal.channel_id(), proposal.allocation.clone(), part_idx)
    }
}

/// The per-asset slice of a funding request handed to a single ledger funder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFundingRequest {
    pub channel: ChannelId,
    pub allocation: AssetAllocation,
    pub part_idx: PartIdx,
}

impl AssetFundingRequest {
    pub fn asset(&self) -> &AssetId {
        &self.allocation.asset
    }
}

/// Funding progress of one (channel, asset) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingStatus {
    /// Not confirmed yet (never submitted, or a submission is in flight).
    Pending,
    /// The ledger confirmed the funding. Further requests are no-ops.
    Confirmed,
    /// The last submission failed; a later request may submit again.
    Failed,
}

impl std::fmt::Display for FundingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Confirmed => write!(f, "Confirmed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// An event reported by a ledger's adjudicator for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjudicatorEvent {
    /// A state was registered on the ledger; it becomes final after `timeout`.
    Registered {
        channel: ChannelId,
        version: u64,
        timeout: DateTime<Utc>,
    },
    /// The channel was concluded on the ledger at `version`.
    Concluded { channel: ChannelId, version: u64 },
}

impl AdjudicatorEvent {
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::Registered { channel, .. } | Self::Concluded { channel, .. } => *channel,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Self::Registered { version, .. } | Self::Concluded { version, .. } => *version,
        }
    }
}

/// An adjudicator event tagged with the asset whose subscription produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub asset: AssetId,
    pub event: AdjudicatorEvent,
}

/// Event stream of a single ledger adjudicator.
pub type EventStream = BoxStream<'static, Result<AdjudicatorEvent, LedgerError>>;

/// Merged, arrival-ordered event stream across assets.
pub type TaggedEventStream = BoxStream<'static, Result<TaggedEvent, LedgerError>>;
