pub mod config;
pub mod error;
pub mod state_machine;
pub mod types;

pub use config::{AssetConfig, ChannelConfig, LedgerConfig, LoggingConfig, SetupConfig};
pub use error::CoreError;
pub use state_machine::{ChannelEvent, ChannelPhase, ChannelStateMachine};
pub use types::{
    AssetAllocation, AssetId, Allocation, Balance, ChannelId, ChannelProposal, ChannelState,
    LedgerAddress, LedgerId, PartIdx, Participant, ProposalId, WireAddress,
};
