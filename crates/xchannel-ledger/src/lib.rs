//! xchannel ledger layer
//!
//! Per-ledger funder and adjudicator abstractions, the asset-keyed registry
//! that routes to them, and the aggregators that fan a channel's funding and
//! dispute handling out across every ledger its allocation touches.

pub mod adapters;
pub mod adjudicator;
pub mod error;
pub mod funder;
pub mod registry;
pub mod traits;
pub mod types;

pub use adapters::local::LocalLedger;
pub use adjudicator::MultiAdjudicator;
pub use error::LedgerError;
pub use funder::MultiFunder;
pub use registry::AssetRegistry;
pub use traits::{Adjudicator, Funder};
pub use types::{
    AdjudicatorEvent, AssetFundingRequest, EventStream, FundingRequest, FundingStatus,
    TaggedEvent, TaggedEventStream,
};
