use crate::state_machine::{ChannelEvent, ChannelPhase};

/// Core channel-model errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("invalid channel transition from {from} on {event:?}")]
    InvalidStateTransition {
        from: ChannelPhase,
        event: ChannelEvent,
    },

    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),

    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("asset not part of allocation: {0}")]
    AssetNotInAllocation(String),

    #[error("participant index {index} out of range for {count} participants")]
    ParticipantOutOfRange { index: usize, count: usize },

    #[error("configuration error: {0}")]
    Config(String),
}
