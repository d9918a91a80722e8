use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

/// Value in the smallest unit of an asset (wei, lamports, ...).
pub type Balance = u128;

/// Index of a participant in a channel. `0` is the proposer.
pub type PartIdx = usize;

/// Opaque identifier of a participating ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerId(String);

impl LedgerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a ledger id from a numeric chain id, e.g. `eth:1337`.
    pub fn from_chain_id(family: &str, chain_id: u64) -> Self {
        Self(format!("{}:{}", family, chain_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routing key for funding and adjudication: a contract (or mint) on one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId {
    ledger: LedgerId,
    contract: String,
}

impl AssetId {
    pub fn new(ledger: LedgerId, contract: impl Into<String>) -> Self {
        Self {
            ledger,
            contract: contract.into(),
        }
    }

    pub fn ledger(&self) -> &LedgerId {
        &self.ledger
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ledger, self.contract)
    }
}

/// A ledger-native account address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerAddress(String);

impl LedgerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a party on the off-chain message bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WireAddress(String);

impl WireAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WireAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One party of a channel: its bus address plus one native address per ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub wire: WireAddress,
    pub addresses: BTreeMap<LedgerId, LedgerAddress>,
}

impl Participant {
    pub fn new(wire: WireAddress) -> Self {
        Self {
            wire,
            addresses: BTreeMap::new(),
        }
    }

    /// Builder-style helper to attach the party's address on `ledger`.
    pub fn with_address(mut self, ledger: LedgerId, address: LedgerAddress) -> Self {
        self.addresses.insert(ledger, address);
        self
    }

    pub fn address(&self, ledger: &LedgerId) -> Option<&LedgerAddress> {
        self.addresses.get(ledger)
    }
}

/// Per-asset balance vectors indexed by participant position.
///
/// Once a proposal has been sent the allocation is owned by the proposal and
/// only handed out by shared reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    participants: usize,
    assets: Vec<AssetId>,
    balances: Vec<Vec<Balance>>,
}

impl Allocation {
    /// Create an allocation with all balances set to zero.
    pub fn new(participants: usize, assets: Vec<AssetId>) -> Self {
        let balances = vec![vec![0; participants]; assets.len()];
        Self {
            participants,
            assets,
            balances,
        }
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    pub fn assets(&self) -> &[AssetId] {
        &self.assets
    }

    fn position(&self, asset: &AssetId) -> Option<usize> {
        self.assets.iter().position(|a| a == asset)
    }

    /// Set the balance vector of `asset`. The vector must have one entry per participant.
    pub fn set_asset_balances(
        &mut self,
        asset: &AssetId,
        balances: Vec<Balance>,
    ) -> Result<(), CoreError> {
        let pos = self
            .position(asset)
            .ok_or_else(|| CoreError::AssetNotInAllocation(asset.to_string()))?;
        if balances.len() != self.participants {
            return Err(CoreError::InvalidAllocation(format!(
                "asset {} has {} balances for {} participants",
                asset,
                balances.len(),
                self.participants
            )));
        }
        self.balances[pos] = balances;
        Ok(())
    }

    pub fn asset_balances(&self, asset: &AssetId) -> Option<&[Balance]> {
        self.position(asset).map(|pos| self.balances[pos].as_slice())
    }

    /// Sum of all participants' balances for `asset`.
    pub fn total(&self, asset: &AssetId) -> Option<Balance> {
        self.asset_balances(asset)
            .and_then(|bals| bals.iter().try_fold(0u128, |acc, b| acc.checked_add(*b)))
    }

    /// The slice of the allocation relevant to a single asset.
    pub fn for_asset(&self, asset: &AssetId) -> Result<AssetAllocation, CoreError> {
        let balances = self
            .asset_balances(asset)
            .ok_or_else(|| CoreError::AssetNotInAllocation(asset.to_string()))?;
        Ok(AssetAllocation {
            asset: asset.clone(),
            balances: balances.to_vec(),
        })
    }

    /// Distinct ledgers touched by this allocation.
    pub fn ledgers(&self) -> BTreeSet<LedgerId> {
        self.assets.iter().map(|a| a.ledger().clone()).collect()
    }

    /// Assets grouped by the ledger they live on.
    pub fn assets_by_ledger(&self) -> BTreeMap<LedgerId, Vec<AssetId>> {
        let mut out: BTreeMap<LedgerId, Vec<AssetId>> = BTreeMap::new();
        for asset in &self.assets {
            out.entry(asset.ledger().clone())
                .or_default()
                .push(asset.clone());
        }
        out
    }

    /// Check the structural invariants of the allocation.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.participants < 2 {
            return Err(CoreError::InvalidAllocation(format!(
                "need at least 2 participants, got {}",
                self.participants
            )));
        }
        if self.assets.is_empty() {
            return Err(CoreError::InvalidAllocation("no assets".into()));
        }
        if self.balances.len() != self.assets.len() {
            return Err(CoreError::InvalidAllocation(format!(
                "{} balance vectors for {} assets",
                self.balances.len(),
                self.assets.len()
            )));
        }
        let mut seen = HashSet::new();
        for (asset, bals) in self.assets.iter().zip(&self.balances) {
            if !seen.insert(asset) {
                return Err(CoreError::InvalidAllocation(format!(
                    "duplicate asset {}",
                    asset
                )));
            }
            if bals.len() != self.participants {
                return Err(CoreError::InvalidAllocation(format!(
                    "asset {} has {} balances for {} participants",
                    asset,
                    bals.len(),
                    self.participants
                )));
            }
            if self.total(asset).is_none() {
                return Err(CoreError::InvalidAllocation(format!(
                    "balance overflow for asset {}",
                    asset
                )));
            }
        }
        Ok(())
    }
}

/// The part of an allocation a single per-asset funder cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAllocation {
    pub asset: AssetId,
    pub balances: Vec<Balance>,
}

impl AssetAllocation {
    pub fn balance_of(&self, idx: PartIdx) -> Option<Balance> {
        self.balances.get(idx).copied()
    }

    pub fn total(&self) -> Balance {
        self.balances.iter().fold(0u128, |acc, b| acc.saturating_add(*b))
    }
}

/// Channel identifier: BLAKE3 digest of the channel proposal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId([u8; 32]);

impl ChannelId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", &hex::encode(self.0)[..16])
    }
}

/// Unique identifier of a channel proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalId(pub Uuid);

impl ProposalId {
    /// Create a new time-ordered proposal ID (UUID v7).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ProposalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A ledger channel proposal as sent by participant 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProposal {
    pub id: ProposalId,
    /// On-chain challenge duration in seconds.
    pub challenge_duration: u64,
    pub participants: Vec<Participant>,
    pub allocation: Allocation,
}

impl ChannelProposal {
    pub fn new(
        challenge_duration: u64,
        participants: Vec<Participant>,
        allocation: Allocation,
    ) -> Result<Self, CoreError> {
        let proposal = Self {
            id: ProposalId::new(),
            challenge_duration,
            participants,
            allocation,
        };
        proposal.validate()?;
        Ok(proposal)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.challenge_duration == 0 {
            return Err(CoreError::InvalidProposal(
                "challenge duration must be positive".into(),
            ));
        }
        if self.participants.len() != self.allocation.participants() {
            return Err(CoreError::InvalidProposal(format!(
                "{} participants but allocation is for {}",
                self.participants.len(),
                self.allocation.participants()
            )));
        }
        self.allocation.validate()?;
        for (idx, part) in self.participants.iter().enumerate() {
            for ledger in self.allocation.ledgers() {
                if part.address(&ledger).is_none() {
                    return Err(CoreError::InvalidProposal(format!(
                        "participant {} has no address on ledger {}",
                        idx, ledger
                    )));
                }
            }
        }
        Ok(())
    }

    /// Deterministic channel id over every field of the proposal.
    pub fn channel_id(&self) -> ChannelId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.0.as_bytes());
        hasher.update(&self.challenge_duration.to_le_bytes());
        for part in &self.participants {
            hasher.update(part.wire.as_str().as_bytes());
            for (ledger, addr) in &part.addresses {
                hasher.update(ledger.as_str().as_bytes());
                hasher.update(addr.as_str().as_bytes());
            }
        }
        for asset in self.allocation.assets() {
            hasher.update(asset.ledger().as_str().as_bytes());
            hasher.update(asset.contract().as_bytes());
            for bal in self.allocation.asset_balances(asset).unwrap_or_default() {
                hasher.update(&bal.to_le_bytes());
            }
        }
        ChannelId(*hasher.finalize().as_bytes())
    }

    pub fn participant_index(&self, wire: &WireAddress) -> Option<PartIdx> {
        self.participants.iter().position(|p| &p.wire == wire)
    }
}

/// The latest off-chain state all participants agreed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub id: ChannelId,
    pub version: u64,
    pub allocation: Allocation,
    pub is_final: bool,
}

impl ChannelState {
    /// Version 0 state matching the proposal's allocation.
    pub fn initial(proposal: &ChannelProposal) -> Self {
        Self {
            id: proposal.channel_id(),
            version: 0,
            allocation: proposal.allocation.clone(),
            is_final: false,
        }
    }
}
