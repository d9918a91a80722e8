use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use xchannel_core::{AssetId, ChannelId, ChannelState};

use crate::error::LedgerError;
use crate::registry::AssetRegistry;
use crate::traits::Adjudicator;
use crate::types::{TaggedEvent, TaggedEventStream};

/// One adjudicator surface for the channel layer, dispatching per asset.
///
/// Backed by the same `AssetRegistry` as the `MultiFunder`, so an asset's
/// funder and adjudicator share one uniqueness check.
pub struct MultiAdjudicator {
    registry: Arc<AssetRegistry>,
}

impl MultiAdjudicator {
    pub fn new(registry: Arc<AssetRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<AssetRegistry> {
        &self.registry
    }

    /// Register an adjudicator while this is the registry's only owner.
    pub fn register(
        &mut self,
        asset: AssetId,
        adjudicator: Arc<dyn Adjudicator>,
    ) -> Result<(), LedgerError> {
        Arc::get_mut(&mut self.registry)
            .ok_or(LedgerError::RegistrySealed)?
            .register_adjudicator(asset, adjudicator)
    }

    /// Subscribe to every distinct asset's adjudicator and merge the streams.
    ///
    /// Events are tagged with the originating asset and delivered in arrival
    /// order. Nothing is subscribed if any asset is unknown.
    pub async fn subscribe(
        &self,
        channel: ChannelId,
        assets: &[AssetId],
    ) -> Result<TaggedEventStream, LedgerError> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for asset in assets {
            if seen.insert(asset) {
                targets.push((asset.clone(), self.registry.adjudicator(asset)?));
            }
        }

        let streams = try_join_all(targets.into_iter().map(|(asset, adj)| async move {
            let events = adj.subscribe(channel).await?;
            tracing::debug!(channel = %channel, asset = %asset, "subscribed to adjudicator events");
            let tagged = events.map(move |item| {
                item.map(|event| TaggedEvent {
                    asset: asset.clone(),
                    event,
                })
            });
            Ok::<_, LedgerError>(tagged.boxed())
        }))
        .await?;

        Ok(stream::select_all(streams).boxed())
    }

    /// Register `state` for `asset` on its ledger.
    ///
    /// The ledger adjudicator's own error is returned unchanged.
    pub async fn dispute(
        &self,
        channel: ChannelId,
        asset: &AssetId,
        state: &ChannelState,
    ) -> Result<(), LedgerError> {
        let adj = self.registry.adjudicator(asset)?;
        tracing::info!(
            channel = %channel,
            asset = %asset,
            version = state.version,
            "submitting dispute"
        );
        adj.dispute(channel, state).await.map_err(|e| {
            tracing::warn!(channel = %channel, asset = %asset, error = %e, "dispute rejected");
            e
        })
    }

    /// Conclude the channel for `asset` on its ledger.
    pub async fn conclude(&self, channel: ChannelId, asset: &AssetId) -> Result<(), LedgerError> {
        let adj = self.registry.adjudicator(asset)?;
        tracing::info!(channel = %channel, asset = %asset, "concluding channel on ledger");
        adj.conclude(channel).await.map_err(|e| {
            tracing::warn!(channel = %channel, asset = %asset, error = %e, "conclude failed");
            e
        })
    }
}
