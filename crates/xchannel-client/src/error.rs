use xchannel_core::{AssetId, ChannelId, ChannelPhase, CoreError, WireAddress};
use xchannel_ledger::LedgerError;

/// Errors surfaced by the coordinator and the protocol engine.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("proposal for channel {channel} rejected: {reason}")]
    ProposalRejected { channel: ChannelId, reason: String },

    #[error("proposal for channel {channel} timed out")]
    ProposalTimeout { channel: ChannelId },

    #[error("proposal for channel {channel} could not be delivered: {source}")]
    ProposalFailed {
        channel: ChannelId,
        source: Box<ClientError>,
    },

    #[error("funding channel {channel} failed: {source}")]
    Funding {
        channel: ChannelId,
        source: LedgerError,
    },

    #[error("peer {0} unreachable")]
    PeerUnreachable(WireAddress),

    #[error("wire address {0} already in use")]
    AddressInUse(WireAddress),

    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("channel {channel} is {phase} and cannot be watched")]
    NotWatchable {
        channel: ChannelId,
        phase: ChannelPhase,
    },

    #[error("channel {0} is already being watched")]
    AlreadyWatching(ChannelId),

    #[error("channel {channel} is {phase} and still in use")]
    ChannelActive {
        channel: ChannelId,
        phase: ChannelPhase,
    },

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("invalid state update for channel {channel}: {reason}")]
    InvalidUpdate { channel: ChannelId, reason: String },

    #[error("coordinator shut down")]
    Shutdown,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// The channel this error concerns, if any.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Self::ProposalRejected { channel, .. }
            | Self::ProposalTimeout { channel }
            | Self::ProposalFailed { channel, .. }
            | Self::Funding { channel, .. }
            | Self::NotWatchable { channel, .. }
            | Self::ChannelActive { channel, .. }
            | Self::InvalidUpdate { channel, .. } => Some(*channel),
            Self::UnknownChannel(channel) | Self::AlreadyWatching(channel) => Some(*channel),
            Self::Watcher(err) => Some(err.channel),
            _ => None,
        }
    }

    /// The asset a funding failure is attributed to, if any.
    pub fn failed_asset(&self) -> Option<&AssetId> {
        match self {
            Self::Funding { source, .. } | Self::Ledger(source) => source.failed_asset(),
            _ => None,
        }
    }
}

/// Non-fatal failure of a dispute watcher. The channel stays as it was.
#[derive(Debug, Clone, thiserror::Error)]
#[error("watcher for channel {channel}: {kind}")]
pub struct WatcherError {
    pub channel: ChannelId,
    pub kind: WatcherErrorKind,
}

impl WatcherError {
    pub fn new(channel: ChannelId, kind: WatcherErrorKind) -> Self {
        Self { channel, kind }
    }

    pub fn asset(&self) -> Option<&AssetId> {
        match &self.kind {
            WatcherErrorKind::Recovery { asset, .. } => Some(asset),
            WatcherErrorKind::Subscribe(source) | WatcherErrorKind::Stream(source) => {
                source.failed_asset()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WatcherErrorKind {
    #[error("adjudicator event stream ended")]
    StreamEnded,

    #[error("subscription failed: {0}")]
    Subscribe(LedgerError),

    #[error("event stream failed: {0}")]
    Stream(LedgerError),

    #[error("recovery for asset {asset} failed: {source}")]
    Recovery { asset: AssetId, source: LedgerError },

    #[error("channel handle dropped")]
    ChannelDropped,
}
