//! Setup configuration. Accepted once at startup and immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::CoreError;
use crate::types::{AssetId, LedgerId};

/// Full setup configuration for a cross-ledger channel client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupConfig {
    /// Participating ledgers and the assets registered on each.
    #[serde(default = "default_ledgers")]
    pub ledgers: Vec<LedgerConfig>,

    /// Channel protocol settings.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One participating ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Ledger identifier used in asset ids, e.g. `eth:1337`.
    pub id: String,
    /// RPC endpoint of the ledger node.
    pub node_url: String,
    /// Numeric chain id (account-based ledgers).
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// Program identifier (program-based ledgers).
    #[serde(default)]
    pub program_id: Option<String>,
    /// On-chain account used for signing, or a reference to its key material.
    pub account: String,
    /// Adjudicator contract or program address.
    pub adjudicator: String,
    /// Assets held on this ledger.
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
}

/// One asset on a ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetConfig {
    /// Asset holder contract or mint address.
    pub contract: String,
    /// Amount this client funds for the asset, in the asset's smallest unit.
    #[serde(default)]
    pub funding_amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// On-chain challenge duration in seconds.
    #[serde(default = "default_challenge_duration")]
    pub challenge_duration_secs: u64,
    /// How long a proposer waits for the peer's answer.
    #[serde(default = "default_proposal_timeout")]
    pub proposal_timeout_secs: u64,
    /// Deadline for a whole multi-ledger funding round.
    #[serde(default = "default_funding_timeout")]
    pub funding_timeout_secs: u64,
    /// Capacity of the accepted-channel queue.
    #[serde(default = "default_accepted_queue_capacity")]
    pub accepted_queue_capacity: usize,
    /// Bounded retries for dispute submissions that fail on the ledger.
    #[serde(default = "default_dispute_retries")]
    pub dispute_retries: u32,
    /// Pause between dispute retries, in milliseconds.
    #[serde(default = "default_dispute_backoff_ms")]
    pub dispute_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_ledgers() -> Vec<LedgerConfig> {
    vec![
        LedgerConfig {
            id: "eth:1337".into(),
            node_url: "ws://127.0.0.1:8545".into(),
            chain_id: Some(1337),
            program_id: None,
            account: "0x0000000000000000000000000000000000000000".into(),
            adjudicator: "0x0000000000000000000000000000000000000001".into(),
            assets: vec![AssetConfig {
                contract: "0x0000000000000000000000000000000000000002".into(),
                funding_amount: 1_000_000_000_000_000_000,
            }],
        },
        LedgerConfig {
            id: "sol:localnet".into(),
            node_url: "http://127.0.0.1:8899".into(),
            chain_id: None,
            program_id: Some("PerunChanne1Program1111111111111111111111111".into()),
            account: "scripts/accounts/alice.json".into(),
            adjudicator: "PerunChanne1Program1111111111111111111111111".into(),
            assets: vec![AssetConfig {
                contract: "11111111111111111111111111111111".into(),
                funding_amount: 50,
            }],
        },
    ]
}
fn default_challenge_duration() -> u64 {
    1000
}
fn default_proposal_timeout() -> u64 {
    180
}
fn default_funding_timeout() -> u64 {
    120
}
fn default_accepted_queue_capacity() -> usize {
    1
}
fn default_dispute_retries() -> u32 {
    3
}
fn default_dispute_backoff_ms() -> u64 {
    500
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            ledgers: default_ledgers(),
            channel: ChannelConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            challenge_duration_secs: default_challenge_duration(),
            proposal_timeout_secs: default_proposal_timeout(),
            funding_timeout_secs: default_funding_timeout(),
            accepted_queue_capacity: default_accepted_queue_capacity(),
            dispute_retries: default_dispute_retries(),
            dispute_backoff_ms: default_dispute_backoff_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ChannelConfig {
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_secs(self.proposal_timeout_secs)
    }

    pub fn funding_timeout(&self) -> Duration {
        Duration::from_secs(self.funding_timeout_secs)
    }

    pub fn dispute_backoff(&self) -> Duration {
        Duration::from_millis(self.dispute_backoff_ms)
    }
}

impl LedgerConfig {
    pub fn ledger_id(&self) -> LedgerId {
        LedgerId::new(self.id.clone())
    }

    pub fn asset_ids(&self) -> Vec<AssetId> {
        self.assets
            .iter()
            .map(|a| AssetId::new(self.ledger_id(), a.contract.clone()))
            .collect()
    }
}

impl SetupConfig {
    /// Every configured asset, in configuration order.
    pub fn asset_ids(&self) -> Vec<AssetId> {
        self.ledgers.iter().flat_map(|l| l.asset_ids()).collect()
    }

    /// Reject configurations the client must not start with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.ledgers.is_empty() {
            return Err(CoreError::Config("no ledgers configured".into()));
        }
        if self.channel.challenge_duration_secs == 0 {
            return Err(CoreError::Config("challenge duration must be positive".into()));
        }
        if self.channel.accepted_queue_capacity == 0 {
            return Err(CoreError::Config(
                "accepted queue capacity must be positive".into(),
            ));
        }

        let mut ledger_ids = HashSet::new();
        let mut assets = HashSet::new();
        for ledger in &self.ledgers {
            if ledger.id.trim().is_empty() {
                return Err(CoreError::Config("ledger with empty id".into()));
            }
            if !ledger_ids.insert(ledger.id.as_str()) {
                return Err(CoreError::Config(format!("duplicate ledger {}", ledger.id)));
            }
            if ledger.chain_id.is_none() && ledger.program_id.is_none() {
                return Err(CoreError::Config(format!(
                    "ledger {} needs a chain_id or program_id",
                    ledger.id
                )));
            }
            if ledger.node_url.trim().is_empty() {
                return Err(CoreError::Config(format!(
                    "ledger {} has no node_url",
                    ledger.id
                )));
            }
            if ledger.adjudicator.trim().is_empty() {
                return Err(CoreError::Config(format!(
                    "ledger {} has no adjudicator address",
                    ledger.id
                )));
            }
            if ledger.assets.is_empty() {
                return Err(CoreError::Config(format!(
                    "ledger {} has no assets",
                    ledger.id
                )));
            }
            for asset in &ledger.assets {
                if asset.contract.trim().is_empty() {
                    return Err(CoreError::Config(format!(
                        "ledger {} has an asset without contract address",
                        ledger.id
                    )));
                }
            }
            for asset in ledger.asset_ids() {
                if !assets.insert(asset.clone()) {
                    return Err(CoreError::Config(format!("duplicate asset {}", asset)));
                }
            }
        }
        Ok(())
    }
}
