use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex, Notify};
use xchannel_core::{AssetId, Balance, ChannelId, ChannelState, CoreError, LedgerId};

use crate::error::LedgerError;
use crate::traits::{Adjudicator, Funder};
use crate::types::{AdjudicatorEvent, AssetFundingRequest, EventStream};

const EVENT_CAPACITY: usize = 256;

/// On-ledger registration record for a channel.
#[derive(Debug, Clone, Copy)]
struct Registration {
    version: u64,
    timeout: DateTime<Utc>,
    concluded: bool,
}

impl Registration {
    /// The event a new subscriber receives for the current record.
    fn replay(&self, channel: ChannelId) -> AdjudicatorEvent {
        if self.concluded {
            AdjudicatorEvent::Concluded {
                channel,
                version: self.version,
            }
        } else {
            AdjudicatorEvent::Registered {
                channel,
                version: self.version,
                timeout: self.timeout,
            }
        }
    }
}

/// In-memory ledger implementing both the funder and the adjudicator side.
///
/// Shared (via `Arc`) by every party's registry so that deposits from all
/// participants land in the same books. Useful for tests and for local
/// simulations that do not talk to a real node. The challenge period is
/// reported in events but not enforced on `conclude`.
///
/// A new subscription first yields the channel's current registration (if
/// any), then every later change.
pub struct LocalLedger {
    id: LedgerId,
    /// Deposits per (channel, asset), indexed by participant.
    deposits: DashMap<(ChannelId, AssetId), Vec<Balance>>,
    /// Number of funding submissions per (channel, asset).
    submissions: DashMap<(ChannelId, AssetId), usize>,
    /// Registered dispute state per channel.
    registered: DashMap<ChannelId, Registration>,
    /// Held while a registration changes and its event is emitted, and while
    /// a subscriber snapshots the record, so each change is seen exactly once.
    sequencer: Mutex<()>,
    /// Woken on every deposit so pending funders can re-check.
    deposited: Notify,
    events: broadcast::Sender<AdjudicatorEvent>,
    challenge_duration: chrono::Duration,
    unreachable: AtomicBool,
    /// Assets whose funding submissions are rejected, with the reason.
    rejecting: DashMap<AssetId, String>,
}

impl LocalLedger {
    /// Create an empty ledger with a 1000 second challenge duration.
    pub fn new(id: LedgerId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            id,
            deposits: DashMap::new(),
            submissions: DashMap::new(),
            registered: DashMap::new(),
            sequencer: Mutex::new(()),
            deposited: Notify::new(),
            events,
            challenge_duration: chrono::Duration::seconds(1000),
            unreachable: AtomicBool::new(false),
            rejecting: DashMap::new(),
        }
    }

    pub fn with_challenge_duration(mut self, secs: u64) -> Self {
        self.challenge_duration = chrono::Duration::seconds(secs as i64);
        self
    }

    pub fn id(&self) -> &LedgerId {
        &self.id
    }

    /// Simulate the node becoming (un)reachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Reject every future funding submission for `asset`.
    pub fn reject_funding(&self, asset: AssetId, reason: impl Into<String>) {
        self.rejecting.insert(asset, reason.into());
    }

    /// Number of funding submissions seen for a (channel, asset) pair.
    pub fn submissions(&self, channel: &ChannelId, asset: &AssetId) -> usize {
        self.submissions
            .get(&(*channel, asset.clone()))
            .map(|n| *n)
            .unwrap_or(0)
    }

    /// Deposits recorded for a (channel, asset) pair, by participant.
    pub fn deposits(&self, channel: &ChannelId, asset: &AssetId) -> Option<Vec<Balance>> {
        self.deposits
            .get(&(*channel, asset.clone()))
            .map(|d| d.value().clone())
    }

    pub fn registered_version(&self, channel: &ChannelId) -> Option<u64> {
        self.registered.get(channel).map(|r| r.version)
    }

    pub fn is_concluded(&self, channel: &ChannelId) -> bool {
        self.registered
            .get(channel)
            .map(|r| r.concluded)
            .unwrap_or(false)
    }

    fn check_reachable(&self) -> Result<(), LedgerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unreachable {
                ledger: self.id.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn is_funded(&self, key: &(ChannelId, AssetId), required: &[Balance]) -> bool {
        self.deposits
            .get(key)
            .map(|deposits| {
                required
                    .iter()
                    .enumerate()
                    .all(|(idx, need)| deposits.get(idx).copied().unwrap_or(0) >= *need)
            })
            .unwrap_or(false)
    }

    fn emit(&self, event: AdjudicatorEvent) {
        // No subscribers is fine: nobody is watching this channel yet.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Funder for LocalLedger {
    async fn fund(&self, request: AssetFundingRequest) -> Result<(), LedgerError> {
        let asset = request.asset().clone();
        if asset.ledger() != &self.id {
            return Err(LedgerError::Rejected {
                ledger: self.id.clone(),
                reason: format!("asset {} is not held on this ledger", asset),
            });
        }
        self.check_reachable()?;
        if let Some(reason) = self.rejecting.get(&asset) {
            return Err(LedgerError::Rejected {
                ledger: self.id.clone(),
                reason: reason.value().clone(),
            });
        }

        let required = request.allocation.balances.clone();
        let share = request
            .allocation
            .balance_of(request.part_idx)
            .ok_or(CoreError::ParticipantOutOfRange {
                index: request.part_idx,
                count: required.len(),
            })?;

        let key = (request.channel, asset.clone());
        *self.submissions.entry(key.clone()).or_insert(0) += 1;
        {
            let mut deposits = self
                .deposits
                .entry(key.clone())
                .or_insert_with(|| vec![0; required.len()]);
            if let Some(slot) = deposits.get_mut(request.part_idx) {
                *slot = share;
            }
        }
        tracing::info!(
            ledger = %self.id,
            channel = %request.channel,
            asset = %asset,
            participant = request.part_idx,
            amount = %share,
            "deposit recorded"
        );
        self.deposited.notify_waiters();

        // Wait for the other participants' deposits.
        loop {
            let notified = self.deposited.notified();
            if self.is_funded(&key, &required) {
                return Ok(());
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Adjudicator for LocalLedger {
    async fn subscribe(&self, channel: ChannelId) -> Result<EventStream, LedgerError> {
        self.check_reachable()?;
        let (rx, replay) = {
            let _seq = self.sequencer.lock().await;
            let rx = self.events.subscribe();
            let replay = self.registered.get(&channel).map(|r| r.replay(channel));
            (rx, replay)
        };
        if let Some(event) = &replay {
            tracing::debug!(
                ledger = %self.id,
                channel = %channel,
                version = event.version(),
                "replaying registration"
            );
        }
        let ledger = self.id.clone();
        let live = stream::unfold((rx, ledger), move |(mut rx, ledger)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.channel() == channel => {
                        return Some((Ok(event), (rx, ledger)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let err = LedgerError::SubscriptionLagged {
                            ledger: ledger.clone(),
                            missed,
                        };
                        return Some((Err(err), (rx, ledger)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream::iter(replay.map(Ok)).chain(live).boxed())
    }

    async fn dispute(&self, channel: ChannelId, state: &ChannelState) -> Result<(), LedgerError> {
        self.check_reachable()?;
        if state.id != channel {
            return Err(LedgerError::Rejected {
                ledger: self.id.clone(),
                reason: format!("state belongs to channel {}", state.id),
            });
        }

        let version = state.version;
        let timeout = Utc::now() + self.challenge_duration;
        let _seq = self.sequencer.lock().await;
        match self.registered.entry(channel) {
            Entry::Occupied(mut occupied) => {
                let reg = occupied.get_mut();
                if reg.concluded {
                    return Err(LedgerError::Rejected {
                        ledger: self.id.clone(),
                        reason: format!("channel {} already concluded", channel),
                    });
                }
                if version < reg.version {
                    return Err(LedgerError::StaleState {
                        channel,
                        submitted: version,
                        registered: reg.version,
                    });
                }
                if version == reg.version {
                    return Ok(());
                }
                reg.version = version;
                reg.timeout = timeout;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Registration {
                    version,
                    timeout,
                    concluded: false,
                });
            }
        }

        tracing::info!(ledger = %self.id, channel = %channel, version, "state registered");
        self.emit(AdjudicatorEvent::Registered {
            channel,
            version,
            timeout,
        });
        Ok(())
    }

    async fn conclude(&self, channel: ChannelId) -> Result<(), LedgerError> {
        self.check_reachable()?;
        let _seq = self.sequencer.lock().await;
        let version = {
            let mut reg = self
                .registered
                .get_mut(&channel)
                .ok_or(LedgerError::NotRegistered(channel))?;
            if reg.concluded {
                return Ok(());
            }
            reg.concluded = true;
            reg.version
        };

        tracing::info!(ledger = %self.id, channel = %channel, version, "channel concluded");
        self.emit(AdjudicatorEvent::Concluded { channel, version });
        Ok(())
    }
}
