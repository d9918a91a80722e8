use tokio::sync::watch;
use xchannel_core::{
    Allocation, ChannelEvent, ChannelId, ChannelPhase, ChannelProposal, ChannelState,
    ChannelStateMachine, CoreError, PartIdx,
};

use crate::error::ClientError;

/// One cross-ledger channel as seen by a single participant.
///
/// Owned by the `ChannelCoordinator`. Phase changes go through `transition`,
/// which applies `ChannelStateMachine` atomically with respect to other
/// transitions of the same channel.
pub struct ChannelHandle {
    id: ChannelId,
    part_idx: PartIdx,
    proposal: ChannelProposal,
    phase: watch::Sender<ChannelPhase>,
    state: watch::Sender<ChannelState>,
}

impl ChannelHandle {
    pub(crate) fn new(proposal: ChannelProposal, part_idx: PartIdx) -> Self {
        let state = ChannelState::initial(&proposal);
        let (phase, _) = watch::channel(ChannelPhase::Proposed);
        let (state, _) = watch::channel(state);
        Self {
            id: proposal.channel_id(),
            part_idx,
            proposal,
            phase,
            state,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Our own participant index. `0` is the proposer.
    pub fn part_idx(&self) -> PartIdx {
        self.part_idx
    }

    pub fn proposal(&self) -> &ChannelProposal {
        &self.proposal
    }

    /// The allocation the channel was funded with.
    pub fn allocation(&self) -> &Allocation {
        &self.proposal.allocation
    }

    pub fn phase(&self) -> ChannelPhase {
        *self.phase.borrow()
    }

    /// Wait until the channel reaches a phase matching `f`, returning it.
    pub async fn wait_for_phase(&self, f: impl Fn(ChannelPhase) -> bool) -> ChannelPhase {
        let mut rx = self.phase.subscribe();
        // The sender lives in `self`, so the receiver cannot observe closure.
        let reached = rx.wait_for(|p| f(*p)).await.map(|phase| *phase);
        reached.unwrap_or_else(|_| self.phase())
    }

    /// Latest agreed off-chain state.
    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.state.borrow().version
    }

    /// Replace the agreed state with a newer one.
    ///
    /// The update must belong to this channel, carry a higher version and an
    /// allocation over the same participants and assets.
    pub fn apply_update(&self, update: ChannelState) -> Result<(), ClientError> {
        let channel = self.id;
        let invalid = |reason: String| ClientError::InvalidUpdate { channel, reason };

        if update.id != channel {
            return Err(invalid(format!("state belongs to channel {}", update.id)));
        }
        if self.phase().is_final() {
            return Err(invalid(format!("channel is {}", self.phase())));
        }
        update.allocation.validate()?;
        let current = self.allocation();
        if update.allocation.participants() != current.participants()
            || update.allocation.assets() != current.assets()
        {
            return Err(invalid("allocation shape changed".into()));
        }

        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if update.version <= state.version {
                result = Err(invalid(format!(
                    "version {} is not newer than {}",
                    update.version, state.version
                )));
                return false;
            }
            *state = update;
            true
        });
        if result.is_ok() {
            tracing::debug!(channel = %channel, version = self.version(), "channel state updated");
        }
        result
    }

    /// Apply a lifecycle event and return the resulting phase.
    pub(crate) fn transition(&self, event: ChannelEvent) -> Result<ChannelPhase, CoreError> {
        let mut result = Err(CoreError::InvalidStateTransition {
            from: self.phase(),
            event,
        });
        self.phase.send_if_modified(|phase| {
            match ChannelStateMachine::transition(*phase, event) {
                Ok(next) => {
                    let changed = next != *phase;
                    *phase = next;
                    result = Ok(next);
                    changed
                }
                Err(e) => {
                    result = Err(e);
                    false
                }
            }
        });
        result
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("part_idx", &self.part_idx)
            .field("phase", &self.phase())
            .field("version", &self.version())
            .finish()
    }
}
