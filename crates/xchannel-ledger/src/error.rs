use xchannel_core::{AssetId, ChannelId, CoreError, LedgerId};

/// Ledger-layer errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("asset already registered: {0}")]
    DuplicateAsset(AssetId),

    #[error("unknown asset: {0}")]
    UnknownAsset(AssetId),

    #[error("asset registry is shared and can no longer be modified")]
    RegistrySealed,

    #[error("funding asset {asset} for channel {channel} failed: {source}")]
    AssetFunding {
        channel: ChannelId,
        asset: AssetId,
        /// Sibling assets that did confirm and are not unwound.
        funded: Vec<AssetId>,
        /// Sibling assets still unconfirmed when the deadline elapsed.
        pending: Vec<AssetId>,
        source: Box<LedgerError>,
    },

    #[error("funding channel {channel} timed out, unconfirmed assets: {}", join_assets(.pending))]
    FundingTimeout {
        channel: ChannelId,
        pending: Vec<AssetId>,
    },

    #[error("stale state for channel {channel}: version {submitted}, registered {registered}")]
    StaleState {
        channel: ChannelId,
        submitted: u64,
        registered: u64,
    },

    #[error("no state registered for channel {0}")]
    NotRegistered(ChannelId),

    #[error("ledger {ledger} unreachable: {reason}")]
    Unreachable { ledger: LedgerId, reason: String },

    #[error("ledger {ledger} rejected submission: {reason}")]
    Rejected { ledger: LedgerId, reason: String },

    #[error("event subscription on ledger {ledger} lagged, {missed} events dropped")]
    SubscriptionLagged { ledger: LedgerId, missed: u64 },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// The asset a funding failure is attributed to, if any.
    pub fn failed_asset(&self) -> Option<&AssetId> {
        match self {
            Self::AssetFunding { asset, .. } => Some(asset),
            Self::UnknownAsset(asset) | Self::DuplicateAsset(asset) => Some(asset),
            _ => None,
        }
    }

    /// Whether retrying the same submission later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::SubscriptionLagged { .. }
        )
    }
}

fn join_assets(assets: &[AssetId]) -> String {
    assets
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
