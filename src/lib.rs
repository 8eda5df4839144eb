//! A state-channel wallet engine.
//!
//! All protocol logic is written as pure reducers over an immutable
//! [SharedData] snapshot. The [WalletState] dispatcher owns that snapshot,
//! routes actions to the running protocol processes and accumulates side
//! effects (relay messages, transactions, display events) in an outbox that
//! the embedding application drains and executes.

pub mod actions;
pub mod channel_store;
pub mod commitment;
pub mod config;
pub mod dispatcher;
pub mod outbox;
pub mod protocols;
pub mod shared_data;
pub mod sig;
pub mod transactions;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use actions::{ChainEvent, StartProcess, WalletAction};
pub use commitment::{Channel, Commitment, CommitmentType, SignedCommitment};
pub use config::WalletConfig;
pub use dispatcher::{ProcessOutcome, WalletState};
pub use shared_data::SharedData;
pub use types::{Address, ChannelId, Hash, PrivateKey, U256};
