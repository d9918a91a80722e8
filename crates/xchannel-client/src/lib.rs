//! xchannel client
//!
//! The application-facing side of a cross-ledger channel: the
//! `ChannelCoordinator` that proposes, accepts and funds channels, the
//! `DisputeWatcher` bound to every open channel, and the in-process wire bus
//! and protocol engine they run on.

pub mod channel;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod recovery;
pub mod watcher;
pub mod wire;

pub use channel::ChannelHandle;
pub use coordinator::ChannelCoordinator;
pub use engine::{ChannelEngine, ProposalHandler};
pub use error::{ClientError, WatcherError, WatcherErrorKind};
pub use recovery::{AdjudicatorRecovery, DisputeRecovery};
pub use watcher::{DisputeWatcher, SubscribedWatcher};
pub use wire::{Envelope, LocalBus, MessageBus, WireMessage};
