use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use xchannel_core::{AssetId, LedgerId};

use crate::error::LedgerError;
use crate::traits::{Adjudicator, Funder};

/// Asset-keyed routing table from an `AssetId` to its ledger backends.
///
/// Registration takes `&mut self`; once the registry is wrapped in an `Arc`
/// and shared with the `MultiFunder` and `MultiAdjudicator` it is read-only,
/// so concurrent lookups need no locking.
#[derive(Default)]
pub struct AssetRegistry {
    funders: HashMap<AssetId, Arc<dyn Funder>>,
    adjudicators: HashMap<AssetId, Arc<dyn Adjudicator>>,
}

impl AssetRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register both backends for `asset`.
    ///
    /// Fails without modifying anything if either side is already registered.
    pub fn register(
        &mut self,
        asset: AssetId,
        funder: Arc<dyn Funder>,
        adjudicator: Arc<dyn Adjudicator>,
    ) -> Result<(), LedgerError> {
        if self.funders.contains_key(&asset) || self.adjudicators.contains_key(&asset) {
            return Err(LedgerError::DuplicateAsset(asset));
        }
        tracing::info!(asset = %asset, ledger = %asset.ledger(), "registering ledger backends");
        self.funders.insert(asset.clone(), funder);
        self.adjudicators.insert(asset, adjudicator);
        Ok(())
    }

    /// Register only the funder for `asset`.
    pub fn register_funder(
        &mut self,
        asset: AssetId,
        funder: Arc<dyn Funder>,
    ) -> Result<(), LedgerError> {
        if self.funders.contains_key(&asset) {
            return Err(LedgerError::DuplicateAsset(asset));
        }
        tracing::info!(asset = %asset, "registering funder");
        self.funders.insert(asset, funder);
        Ok(())
    }

    /// Register only the adjudicator for `asset`.
    pub fn register_adjudicator(
        &mut self,
        asset: AssetId,
        adjudicator: Arc<dyn Adjudicator>,
    ) -> Result<(), LedgerError> {
        if self.adjudicators.contains_key(&asset) {
            return Err(LedgerError::DuplicateAsset(asset));
        }
        tracing::info!(asset = %asset, "registering adjudicator");
        self.adjudicators.insert(asset, adjudicator);
        Ok(())
    }

    /// Look up both backends for `asset`.
    pub fn resolve(
        &self,
        asset: &AssetId,
    ) -> Result<(Arc<dyn Funder>, Arc<dyn Adjudicator>), LedgerError> {
        Ok((self.funder(asset)?, self.adjudicator(asset)?))
    }

    pub fn funder(&self, asset: &AssetId) -> Result<Arc<dyn Funder>, LedgerError> {
        self.funders
            .get(asset)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownAsset(asset.clone()))
    }

    pub fn adjudicator(&self, asset: &AssetId) -> Result<Arc<dyn Adjudicator>, LedgerError> {
        self.adjudicators
            .get(asset)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownAsset(asset.clone()))
    }

    /// Whether both backends are registered for `asset`.
    pub fn contains(&self, asset: &AssetId) -> bool {
        self.funders.contains_key(asset) && self.adjudicators.contains_key(asset)
    }

    /// Every asset with at least one registered backend, sorted.
    pub fn assets(&self) -> Vec<AssetId> {
        let set: BTreeSet<&AssetId> = self.funders.keys().chain(self.adjudicators.keys()).collect();
        set.into_iter().cloned().collect()
    }

    pub fn ledgers(&self) -> BTreeSet<LedgerId> {
        self.assets().iter().map(|a| a.ledger().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.assets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.funders.is_empty() && self.adjudicators.is_empty()
    }
}
