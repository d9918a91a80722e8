use std::fmt;

use crate::error::CoreError;

/// Lifecycle phases of a cross-ledger channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChannelPhase {
    /// The proposal has been sent or received but not yet answered.
    Proposed,
    /// The proposal was accepted and per-asset funding is in flight.
    Funding,
    /// Every asset is funded; the channel is usable.
    Open,
    /// A ledger reported a state that diverges from the latest agreed one.
    Disputed,
    /// Every asset was concluded on its ledger. Final state.
    Closed,
    /// Proposal rejected or funding failed. Final state.
    Aborted,
}

impl ChannelPhase {
    /// Whether this is a final (terminal) phase.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }

    /// Whether a dispute watcher should be running in this phase.
    pub fn is_watchable(&self) -> bool {
        matches!(self, Self::Open | Self::Disputed)
    }
}

impl fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposed => write!(f, "Proposed"),
            Self::Funding => write!(f, "Funding"),
            Self::Open => write!(f, "Open"),
            Self::Disputed => write!(f, "Disputed"),
            Self::Closed => write!(f, "Closed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Events that trigger lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    ProposalAccepted,
    ProposalRejected,
    FundingCompleted,
    FundingFailed,
    /// A ledger's registered state diverged from the agreed state.
    DisputeDetected,
    /// Every asset has been concluded on its ledger.
    Concluded,
}

/// Channel lifecycle transitions.
///
/// Valid transitions:
/// - Proposed → Funding (ProposalAccepted)
/// - Proposed → Aborted (ProposalRejected, FundingFailed)
/// - Funding → Open (FundingCompleted)
/// - Funding → Aborted (FundingFailed)
/// - Open → Disputed (DisputeDetected)
/// - Disputed → Disputed (DisputeDetected, another asset or a repeated fork)
/// - Open → Closed (Concluded)
/// - Disputed → Closed (Concluded)
pub struct ChannelStateMachine;

impl ChannelStateMachine {
    /// Attempt a transition. Returns the new phase or an error for invalid transitions.
    pub fn transition(
        current: ChannelPhase,
        event: ChannelEvent,
    ) -> Result<ChannelPhase, CoreError> {
        let next = match (current, event) {
            (ChannelPhase::Proposed, ChannelEvent::ProposalAccepted) => ChannelPhase::Funding,
            (ChannelPhase::Proposed, ChannelEvent::ProposalRejected) => ChannelPhase::Aborted,
            (ChannelPhase::Proposed, ChannelEvent::FundingFailed) => ChannelPhase::Aborted,

            (ChannelPhase::Funding, ChannelEvent::FundingCompleted) => ChannelPhase::Open,
            (ChannelPhase::Funding, ChannelEvent::FundingFailed) => ChannelPhase::Aborted,

            (ChannelPhase::Open, ChannelEvent::DisputeDetected) => ChannelPhase::Disputed,
            (ChannelPhase::Disputed, ChannelEvent::DisputeDetected) => ChannelPhase::Disputed,

            (ChannelPhase::Open, ChannelEvent::Concluded) => ChannelPhase::Closed,
            (ChannelPhase::Disputed, ChannelEvent::Concluded) => ChannelPhase::Closed,

            _ => {
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    event,
                })
            }
        };

        tracing::debug!(
            from = %current,
            to = %next,
            event = ?event,
            "channel phase transition"
        );

        Ok(next)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: ChannelPhase, event: ChannelEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
