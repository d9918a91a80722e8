use std::collections::HashSet;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use tokio::sync::mpsc;
use xchannel_core::{AssetId, ChannelEvent, ChannelId};
use xchannel_ledger::{AdjudicatorEvent, MultiAdjudicator, TaggedEvent, TaggedEventStream};

use crate::channel::ChannelHandle;
use crate::error::{WatcherError, WatcherErrorKind};
use crate::recovery::DisputeRecovery;

/// Message from a watcher to the coordinator's lifecycle task.
#[derive(Debug)]
pub(crate) enum LifecycleUpdate {
    /// Apply `event` to the channel. `asset` names the ledger asset that caused it.
    Event {
        channel: ChannelId,
        asset: Option<AssetId>,
        event: ChannelEvent,
    },
    /// A watcher hit a non-fatal error.
    WatcherFailed(WatcherError),
}

/// Background monitor of one open channel's adjudicator events.
///
/// Holds only a weak reference to the channel; phase changes are posted to
/// the coordinator instead of applied directly.
pub struct DisputeWatcher {
    channel_id: ChannelId,
    channel: Weak<ChannelHandle>,
    assets: Vec<AssetId>,
    adjudicator: Arc<MultiAdjudicator>,
    recovery: Arc<dyn DisputeRecovery>,
    updates: mpsc::Sender<LifecycleUpdate>,
}

/// A `DisputeWatcher` whose adjudicator subscriptions are open.
pub struct SubscribedWatcher {
    watcher: DisputeWatcher,
    events: TaggedEventStream,
}

impl DisputeWatcher {
    pub(crate) fn new(
        channel: &Arc<ChannelHandle>,
        adjudicator: Arc<MultiAdjudicator>,
        recovery: Arc<dyn DisputeRecovery>,
        updates: mpsc::Sender<LifecycleUpdate>,
    ) -> Self {
        Self {
            channel_id: channel.id(),
            channel: Arc::downgrade(channel),
            assets: channel.allocation().assets().to_vec(),
            adjudicator,
            recovery,
            updates,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Subscribe to every asset's adjudicator.
    ///
    /// Every event a ledger reports after this returns is seen by
    /// `SubscribedWatcher::run`.
    pub async fn subscribe(self) -> Result<SubscribedWatcher, WatcherError> {
        self.handle()?;
        let events = self
            .adjudicator
            .subscribe(self.channel_id, &self.assets)
            .await
            .map_err(|e| self.error(WatcherErrorKind::Subscribe(e)))?;
        tracing::debug!(channel = %self.channel_id, "dispute watcher subscribed");
        Ok(SubscribedWatcher {
            watcher: self,
            events,
        })
    }

    /// Subscribe, then watch until every asset has been concluded.
    pub async fn run(self) -> Result<(), WatcherError> {
        self.subscribe().await?.run().await
    }

    async fn on_registered(&self, asset: AssetId, version: u64) -> Result<(), WatcherError> {
        let handle = self.handle()?;
        let agreed = handle.version();
        if version == agreed {
            tracing::debug!(
                channel = %self.channel_id,
                asset = %asset,
                version,
                "agreed state registered"
            );
            return Ok(());
        }

        tracing::warn!(
            channel = %self.channel_id,
            asset = %asset,
            registered = version,
            agreed,
            "divergent state registered"
        );
        self.post(LifecycleUpdate::Event {
            channel: self.channel_id,
            asset: Some(asset.clone()),
            event: ChannelEvent::DisputeDetected,
        })
        .await;

        if let Err(source) = self.recovery.recover(&handle, &asset).await {
            let err = self.error(WatcherErrorKind::Recovery { asset, source });
            tracing::warn!(error = %err, "dispute recovery failed");
            self.post(LifecycleUpdate::WatcherFailed(err)).await;
        }
        Ok(())
    }

    fn handle(&self) -> Result<Arc<ChannelHandle>, WatcherError> {
        self.channel
            .upgrade()
            .ok_or_else(|| self.error(WatcherErrorKind::ChannelDropped))
    }

    fn error(&self, kind: WatcherErrorKind) -> WatcherError {
        WatcherError::new(self.channel_id, kind)
    }

    async fn post(&self, update: LifecycleUpdate) {
        if self.updates.send(update).await.is_err() {
            tracing::debug!(channel = %self.channel_id, "coordinator gone, update dropped");
        }
    }
}

impl SubscribedWatcher {
    pub fn channel_id(&self) -> ChannelId {
        self.watcher.channel_id
    }

    /// Watch until every asset has been concluded.
    ///
    /// Returns `Ok` once the channel is concluded on all ledgers. Any other
    /// exit is a `WatcherError`.
    pub async fn run(self) -> Result<(), WatcherError> {
        let Self {
            watcher,
            mut events,
        } = self;
        let channel = watcher.channel_id;
        tracing::info!(
            channel = %channel,
            assets = watcher.assets.len(),
            "dispute watcher started"
        );

        let mut concluded: HashSet<AssetId> = HashSet::new();
        while let Some(item) = events.next().await {
            let TaggedEvent { asset, event } = match item {
                Ok(tagged) => tagged,
                Err(e) if e.is_transient() => {
                    tracing::warn!(channel = %channel, error = %e, "transient adjudicator error");
                    continue;
                }
                Err(e) => return Err(watcher.error(WatcherErrorKind::Stream(e))),
            };

            match event {
                AdjudicatorEvent::Registered { version, .. } => {
                    watcher.on_registered(asset, version).await?;
                }
                AdjudicatorEvent::Concluded { version, .. } => {
                    tracing::info!(channel = %channel, asset = %asset, version, "asset concluded");
                    concluded.insert(asset);
                    if watcher.assets.iter().all(|a| concluded.contains(a)) {
                        watcher
                            .post(LifecycleUpdate::Event {
                                channel,
                                asset: None,
                                event: ChannelEvent::Concluded,
                            })
                            .await;
                        tracing::info!(
                            channel = %channel,
                            "channel concluded on all ledgers, watcher done"
                        );
                        return Ok(());
                    }
                }
            }
        }

        Err(watcher.error(WatcherErrorKind::StreamEnded))
    }
}
