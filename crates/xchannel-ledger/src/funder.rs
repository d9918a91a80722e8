use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use xchannel_core::{AssetId, ChannelId, CoreError};

use crate::error::LedgerError;
use crate::registry::AssetRegistry;
use crate::traits::Funder;
use crate::types::{AssetFundingRequest, FundingRequest, FundingStatus};

type StatusGuard = Arc<Mutex<FundingStatus>>;

/// Aggregates per-asset funding into one funding round per channel.
///
/// Every distinct asset of the allocation is funded by its own spawned task.
/// Tasks are never aborted: once a submission is broadcast it is left to
/// finish even if the caller stops waiting.
pub struct MultiFunder {
    registry: Arc<AssetRegistry>,
    /// Per-(channel, asset) funding status, each behind its own guard.
    status: Arc<DashMap<(ChannelId, AssetId), StatusGuard>>,
}

impl MultiFunder {
    pub fn new(registry: Arc<AssetRegistry>) -> Self {
        Self {
            registry,
            status: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AssetRegistry> {
        &self.registry
    }

    /// Register a funder while this `MultiFunder` is the registry's only owner.
    pub fn register(&mut self, asset: AssetId, funder: Arc<dyn Funder>) -> Result<(), LedgerError> {
        Arc::get_mut(&mut self.registry)
            .ok_or(LedgerError::RegistrySealed)?
            .register_funder(asset, funder)
    }

    /// Tracked funding status of a (channel, asset) pair.
    ///
    /// Reports `Pending` while a submission for the pair is in flight.
    pub fn status(&self, channel: &ChannelId, asset: &AssetId) -> Option<FundingStatus> {
        let guard = self.status.get(&(*channel, asset.clone()))?.value().clone();
        let status = guard
            .try_lock()
            .map(|s| *s)
            .unwrap_or(FundingStatus::Pending);
        Some(status)
    }

    /// Drop tracked status of every asset of `channel`.
    pub fn forget(&self, channel: &ChannelId) {
        self.status.retain(|(c, _), _| c != channel);
    }

    /// Fund every asset of `request.allocation` for `request.part_idx`.
    ///
    /// Succeeds only if every per-asset funding succeeds. A failure is
    /// reported after all sibling submissions have settled. If `timeout`
    /// elapses first, outstanding submissions keep running detached and the
    /// error lists the unconfirmed assets: `AssetFunding` with `pending` set
    /// when an asset had already failed, `FundingTimeout` otherwise.
    pub async fn fund(
        &self,
        request: &FundingRequest,
        timeout: Duration,
    ) -> Result<(), LedgerError> {
        let channel = request.channel;
        let allocation = &request.allocation;
        allocation.validate()?;
        if request.part_idx >= allocation.participants() {
            return Err(CoreError::ParticipantOutOfRange {
                index: request.part_idx,
                count: allocation.participants(),
            }
            .into());
        }

        // Resolve everything before submitting anything.
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for asset in allocation.assets() {
            if !seen.insert(asset) {
                continue;
            }
            let funder = self.registry.funder(asset)?;
            let slice = allocation.for_asset(asset)?;
            jobs.push((asset.clone(), funder, slice));
        }

        for (ledger, assets) in allocation.assets_by_ledger() {
            tracing::debug!(
                channel = %channel,
                ledger = %ledger,
                assets = assets.len(),
                "funding on ledger"
            );
        }

        let deadline = Instant::now() + timeout;
        let mut pending: BTreeSet<AssetId> = BTreeSet::new();
        let mut inflight = FuturesUnordered::new();
        for (asset, funder, slice) in jobs {
            let guard = self
                .status
                .entry((channel, asset.clone()))
                .or_insert_with(|| Arc::new(Mutex::new(FundingStatus::Pending)))
                .value()
                .clone();
            let req = AssetFundingRequest {
                channel,
                allocation: slice,
                part_idx: request.part_idx,
            };
            let handle = tokio::spawn(fund_asset(funder, guard, req));
            pending.insert(asset.clone());
            inflight.push(async move { (asset, handle.await) });
        }

        let mut funded = Vec::new();
        let mut failure: Option<(AssetId, LedgerError)> = None;
        loop {
            let next = match tokio::time::timeout_at(deadline, inflight.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let pending: Vec<AssetId> = pending.into_iter().collect();
                    tracing::warn!(
                        channel = %channel,
                        pending = pending.len(),
                        failed = failure.is_some(),
                        "funding deadline elapsed"
                    );
                    return Err(match failure {
                        Some((asset, source)) => LedgerError::AssetFunding {
                            channel,
                            asset,
                            funded,
                            pending,
                            source: Box::new(source),
                        },
                        None => LedgerError::FundingTimeout { channel, pending },
                    });
                }
            };
            let Some((asset, joined)) = next else {
                break;
            };
            pending.remove(&asset);
            let result = joined.unwrap_or_else(|e| {
                Err(LedgerError::Internal(format!(
                    "funding task for {} failed: {}",
                    asset, e
                )))
            });
            match result {
                Ok(()) => {
                    tracing::debug!(channel = %channel, asset = %asset, "asset funded");
                    funded.push(asset);
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %channel,
                        asset = %asset,
                        error = %e,
                        "asset funding failed"
                    );
                    if failure.is_none() {
                        failure = Some((asset, e));
                    }
                }
            }
        }

        match failure {
            Some((asset, source)) => Err(LedgerError::AssetFunding {
                channel,
                asset,
                funded,
                pending: Vec::new(),
                source: Box::new(source),
            }),
            None => {
                tracing::info!(
                    channel = %channel,
                    assets = funded.len(),
                    "channel funded on all ledgers"
                );
                Ok(())
            }
        }
    }
}

/// Fund a single asset under its (channel, asset) guard.
async fn fund_asset(
    funder: Arc<dyn Funder>,
    guard: StatusGuard,
    request: AssetFundingRequest,
) -> Result<(), LedgerError> {
    let mut status = guard.lock().await;
    if *status == FundingStatus::Confirmed {
        tracing::debug!(
            channel = %request.channel,
            asset = %request.asset(),
            "already funded, skipping"
        );
        return Ok(());
    }
    *status = FundingStatus::Pending;
    match funder.fund(request).await {
        Ok(()) => {
            *status = FundingStatus::Confirmed;
            Ok(())
        }
        Err(e) => {
            *status = FundingStatus::Failed;
            Err(e)
        }
    }
}
