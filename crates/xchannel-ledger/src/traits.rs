use async_trait::async_trait;
use xchannel_core::{ChannelId, ChannelState};

use crate::error::LedgerError;
use crate::types::{AssetFundingRequest, EventStream};

/// Ledger-specific funding backend.
///
/// Each implementation commits funds for one or more assets on a concrete
/// ledger. Dropping the returned future stops the caller from waiting; it
/// must not be relied on to retract a submission already broadcast.
#[async_trait]
pub trait Funder: Send + Sync {
    /// Commit `request.part_idx`'s share of the asset and wait until the
    /// asset is fully funded for the channel.
    async fn fund(&self, request: AssetFundingRequest) -> Result<(), LedgerError>;
}

/// Ledger-specific dispute resolution backend.
#[async_trait]
pub trait Adjudicator: Send + Sync {
    /// Stream of adjudicator events concerning `channel`.
    async fn subscribe(&self, channel: ChannelId) -> Result<EventStream, LedgerError>;

    /// Register `state` on the ledger, starting or advancing a dispute.
    async fn dispute(&self, channel: ChannelId, state: &ChannelState) -> Result<(), LedgerError>;

    /// Finalize the channel on the ledger with the registered state.
    async fn conclude(&self, channel: ChannelId) -> Result<(), LedgerError>;
}
