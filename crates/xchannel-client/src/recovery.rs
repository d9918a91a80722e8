use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use xchannel_core::{AssetId, ChannelConfig};
use xchannel_ledger::{LedgerError, MultiAdjudicator};

use crate::channel::ChannelHandle;

/// Reaction to a divergent on-ledger registration.
#[async_trait]
pub trait DisputeRecovery: Send + Sync {
    /// Bring the registered state of `asset` back to the channel's latest
    /// agreed state.
    async fn recover(&self, channel: &ChannelHandle, asset: &AssetId) -> Result<(), LedgerError>;
}

/// Registers the latest agreed state through the `MultiAdjudicator`.
///
/// A `StaleState` answer is retried with a newer agreed state when one
/// exists. Other failures are retried up to `retries` times, `backoff`
/// apart.
pub struct AdjudicatorRecovery {
    adjudicator: Arc<MultiAdjudicator>,
    retries: u32,
    backoff: Duration,
}

impl AdjudicatorRecovery {
    pub fn new(adjudicator: Arc<MultiAdjudicator>, retries: u32, backoff: Duration) -> Self {
        Self {
            adjudicator,
            retries,
            backoff,
        }
    }

    pub fn from_config(adjudicator: Arc<MultiAdjudicator>, config: &ChannelConfig) -> Self {
        Self::new(adjudicator, config.dispute_retries, config.dispute_backoff())
    }
}

#[async_trait]
impl DisputeRecovery for AdjudicatorRecovery {
    async fn recover(&self, channel: &ChannelHandle, asset: &AssetId) -> Result<(), LedgerError> {
        let id = channel.id();
        let mut state = channel.state();
        let mut attempt = 0u32;
        loop {
            let err = match self.adjudicator.dispute(id, asset, &state).await {
                Ok(()) => {
                    tracing::info!(
                        channel = %id,
                        asset = %asset,
                        version = state.version,
                        "agreed state registered"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };
            if attempt >= self.retries {
                return Err(err);
            }
            attempt += 1;

            match &err {
                LedgerError::StaleState { registered, .. } => {
                    let latest = channel.state();
                    if latest.version <= *registered {
                        return Err(err);
                    }
                    tracing::debug!(
                        channel = %id,
                        asset = %asset,
                        registered = *registered,
                        version = latest.version,
                        "retrying with newer state"
                    );
                    state = latest;
                }
                _ => {
                    tracing::warn!(
                        channel = %id,
                        asset = %asset,
                        attempt,
                        error = %err,
                        "dispute submission failed, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}
